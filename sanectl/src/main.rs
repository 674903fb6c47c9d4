mod config;
mod pnm;
mod scan;

use anyhow::{anyhow, Context};
use argh::FromArgs;
use config::Config;
use libsane_engine::{Backend, OptionType, SaneError, Session, State, Transport};
use log::Level;
use std::{path::PathBuf, process};

#[derive(FromArgs)]
/// Scan images with SCSI scanners
struct Args {
    /// path to config
    #[argh(option)]
    config: PathBuf,

    /// device to scan with, the first attached one by default
    #[argh(option)]
    device: Option<String>,

    /// print attached devices and exit
    #[argh(switch)]
    list_devices: bool,

    /// print options of the device and exit
    #[argh(switch)]
    list_options: bool,

    /// set an option before scanning, as name=value
    #[argh(option)]
    set: Vec<String>,

    /// output file, further images are numbered
    #[argh(option, default = "PathBuf::from(\"out.pnm\")")]
    output: PathBuf,

    /// scan sheets until the feeder is empty
    #[argh(switch)]
    batch: bool,

    /// enable extra logs
    #[argh(switch)]
    verbose: bool,
}

fn main() {
    let args: Args = argh::from_env();

    let level = if args.verbose { Level::Trace } else { Level::Info };
    if let Err(err) = simple_logger::init_with_level(level) {
        eprintln!("Failed to init logger: {err}");
        process::exit(1);
    }

    hello(&args);

    let config = match Config::read_from(&args.config) {
        Ok(config) => config,
        Err(err) => {
            log::error!("Failed to read config: {err:#}");
            process::exit(1);
        }
    };

    if args.verbose {
        log::debug!("Use config {config:#?}");
    }

    if let Err(err) = run(&args, &config) {
        log::error!("{err:#}");
        process::exit(1);
    }
}

fn hello(args: &Args) {
    log::info!(
        "{bin} version {version}, commit {commit}, config from {config_path}, verbose {verbose}",
        bin = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        commit = env!("GIT_COMMIT_HASH"),
        config_path = args.config.display(),
        verbose = if args.verbose { "on" } else { "off" },
    );
}

fn run(args: &Args, config: &Config) -> anyhow::Result<()> {
    let backend = attach_devices(config)?;

    if args.list_devices {
        for device in backend.get_all_devices() {
            println!("device {device}");
        }
        return Ok(());
    }

    let device_name = match &args.device {
        Some(name) => name.clone(),
        None => backend
            .get_all_devices()
            .first()
            .map(|device| device.name.clone())
            .ok_or_else(|| anyhow!("no scanner attached"))?,
    };

    log::debug!("Use scanner '{device_name}'");

    let mut session = backend
        .open(&device_name, transport()?)
        .with_context(|| format!("opening device '{device_name}'"))?;

    scan::setup_session(&mut session, config.options.get(&device_name), &args.set)?;

    if args.list_options {
        print_options(&session);
        return Ok(());
    }

    let images = scan_sheets(&mut session, args)?;
    log::info!("Scanned {images} images");

    session.close().context("closing device")?;
    Ok(())
}

fn attach_devices(config: &Config) -> anyhow::Result<Backend> {
    let mut backend = Backend::new();

    for device in &config.devices {
        let attached = match device.dialect {
            Some(kind) => backend.attach_with(&device.path, kind, transport()?),
            None => backend.attach(&device.path, transport()?),
        };

        match attached {
            Ok(profile) => log::info!("Found {profile}"),
            Err(err) => {
                log::warn!("Failed to attach '{}': {err}", device.path);
                continue;
            }
        }

        backend.set_reader_config(&device.path, device.reader)?;
    }

    Ok(backend)
}

/// Scan until the device runs out of paper in batch mode, a single sheet
/// otherwise. Every image of a sheet goes to its own file.
fn scan_sheets(session: &mut Session, args: &Args) -> anyhow::Result<usize> {
    let mut index = 0;

    loop {
        let image = match scan::scan_image(session) {
            Ok(image) => image,
            Err(err) if args.batch && index > 0 && is_no_docs(&err) => {
                log::info!("Document feeder is empty");
                break;
            }
            Err(err) => return Err(err),
        };

        save(args, index, &image)?;
        index += 1;

        // Further images of the same sheet: duplex back side or infrared.
        while session.state() == State::Ready {
            let image = scan::scan_image(session).context("scanning next frame")?;
            save(args, index, &image)?;
            index += 1;
        }

        if !args.batch {
            break;
        }
    }

    Ok(index)
}

fn is_no_docs(err: &anyhow::Error) -> bool {
    err.downcast_ref::<SaneError>() == Some(&SaneError::NoDocs)
}

fn save(args: &Args, index: usize, image: &scan::Image) -> anyhow::Result<()> {
    let path = pnm::numbered(&args.output, index);
    pnm::save(&path, &image.parameters, &image.bytes)?;

    log::info!(
        "Saved {}x{} {} image to '{}'",
        image.parameters.pixels_per_line,
        image.parameters.lines,
        image.parameters.format,
        path.display()
    );
    Ok(())
}

fn print_options(session: &Session) {
    println!("Options specific to device '{}':", session.profile().name);

    for (i, option) in session.options().iter().skip(1) {
        if option.ty == OptionType::Group {
            println!("  {}:", option.title);
            continue;
        }

        let value = if !option.is_active() {
            "inactive".to_owned()
        } else {
            session.get_option(i).map(|value| value.to_string()).unwrap_or_default()
        };

        let unit = match option.unit {
            libsane_engine::OptionUnit::None => String::new(),
            unit => unit.to_string(),
        };

        println!("    --{} {}{unit} [{value}]", option.name, option.constraint);
        if !option.description.is_empty() {
            println!("        {}", option.description);
        }
    }
}

#[cfg(target_os = "linux")]
fn transport() -> anyhow::Result<Box<dyn Transport>> {
    Ok(Box::new(libsane_engine::transport::sg::SgTransport::new()))
}

#[cfg(not(target_os = "linux"))]
fn transport() -> anyhow::Result<Box<dyn Transport>> {
    anyhow::bail!("SCSI generic devices are only supported on Linux")
}
