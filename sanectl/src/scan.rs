use anyhow::{anyhow, Context};
use bstr::{BString, ByteSlice};
use libsane_engine::{OptionType, Parameters, Session};
use std::{collections::HashMap, io::Read};

pub struct Image {
    pub parameters: Parameters,
    pub bytes: Vec<u8>,
}

/// Apply configured values first, then command line overrides.
pub fn setup_session(
    session: &mut Session,
    configured: Option<&HashMap<BString, BString>>,
    overrides: &[String],
) -> anyhow::Result<()> {
    let device_name = session.profile().name.clone();

    let names: Vec<(usize, &'static str, bool)> = session
        .options()
        .iter()
        .skip(1)
        .filter(|(_, option)| option.ty != OptionType::Group && !option.name.is_empty())
        .map(|(i, option)| (i, option.name, option.is_auto_settable()))
        .collect();

    log::debug!("Start device setup, {} options available", names.len());

    for (i, option_name, auto_settable) in names {
        let value = configured.and_then(|config| config.get(option_name.as_bytes().as_bstr()));

        if let Some(value) = value {
            match session.set_option_by_name(option_name, &value.to_str_lossy()) {
                Ok(outcome) => {
                    log::debug!("Successfully set value '{}' for option '{option_name}' (#{i})", outcome.value);
                    continue;
                }
                Err(err) => {
                    log::warn!("Failed to set '{value}' value for option '{option_name}' (#{i}): {err}");
                }
            }
        }

        if auto_settable {
            match session.set_auto(i) {
                Ok(_) => log::debug!("Successfully set automatic value for option '{option_name}' (#{i})"),
                Err(err) => log::warn!("Failed to auto configure option '{option_name}' (#{i}): {err}"),
            }
        }
    }

    if configured.is_none() {
        log::debug!("No custom options for device '{device_name}'");
    }

    for assignment in overrides {
        let (name, value) = assignment
            .split_once('=')
            .ok_or_else(|| anyhow!("option '{assignment}' is not of the form name=value"))?;

        let outcome = session
            .set_option_by_name(name.trim(), value)
            .with_context(|| format!("setting option '{name}' to '{value}'"))?;

        if outcome.info.contains(libsane_engine::OptionInfo::Inexact) {
            log::warn!("Option '{name}' was set to '{}' instead of '{value}'", outcome.value);
        }
    }

    Ok(())
}

/// Start the next image and read it to the end.
pub fn scan_image(session: &mut Session) -> anyhow::Result<Image> {
    let mut reader = session.start_page().context("starting scan")?;
    let parameters = reader.get_parameters().context("getting parameters")?;

    log::debug!("Start scan with parameters {parameters:?}");

    let page_size = parameters.frame_size();
    let mut page = Vec::with_capacity(page_size);
    let mut window = vec![0u8; WINDOW_SIZE];

    let mut previous_progress = 0.0;
    loop {
        let read = reader.read(&mut window).context("reading from scanner")?;
        if read == 0 {
            break;
        }

        page.extend_from_slice(&window[..read]);

        let progress = page.len() as f64 / page_size.max(1) as f64 * 100.;
        log::trace!("Scan progress {} of {page_size} bytes ({progress:.0}%)", page.len());

        if progress - previous_progress >= 5.0 {
            log::info!("Progress {progress:.0}%");
            previous_progress = progress;
        }
    }

    log::debug!("Scan done, {} bytes", page.len());

    Ok(Image {
        parameters,
        bytes: page,
    })
}

const WINDOW_SIZE: usize = 128 * 1024;
