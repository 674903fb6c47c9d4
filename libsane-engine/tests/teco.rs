mod common;

use common::{count, opcodes, read_frame, teco_inquiry};
use libsane_engine::{
    options::names,
    transport::mock::MockTransport,
    wait::RecordingSleeper,
    Backend, FrameFormat, OptionValue, ReaderConfig, SaneError, Session, State,
};
use pretty_assertions::assert_eq;
use std::{
    sync::atomic::Ordering,
    thread,
    time::{Duration, Instant},
};

const DEVICE: &str = "/dev/sg1";

fn buffer_status() -> Vec<u8> {
    let mut raw = vec![0u8; 0x12];
    raw[9..12].copy_from_slice(&[0x00, 0x27, 0x10]);
    raw[12..14].copy_from_slice(&[0x00, 0x64]);
    raw[14..16].copy_from_slice(&[0x00, 0x64]);
    raw
}

/// 100 lines of the ramp 0..100.
fn image() -> Vec<u8> {
    (0..10_000).map(|i| (i % 100) as u8).collect()
}

fn empty_buffer_status() -> Vec<u8> {
    let mut raw = buffer_status();
    raw[9..12].fill(0);
    raw
}

fn scanner() -> MockTransport {
    let mut mock = MockTransport::new();
    mock.reply(&[0x12, 0x00], teco_inquiry());
    mock.reply(&[0x34], buffer_status());
    mock.reply(&[0x28], image());
    mock
}

fn open(backend: &mut Backend, mock: MockTransport) -> Session {
    backend.attach(DEVICE, Box::new(scanner())).unwrap();
    backend.open(DEVICE, Box::new(mock)).unwrap()
}

fn open_overlapped(backend: &mut Backend, mock: MockTransport, buffers: usize, buffer_size: usize) -> Session {
    backend.attach(DEVICE, Box::new(scanner())).unwrap();
    backend
        .set_reader_config(
            DEVICE,
            ReaderConfig {
                overlapped: true,
                buffers,
                buffer_size,
            },
        )
        .unwrap();

    backend.open(DEVICE, Box::new(mock)).unwrap()
}

/// One inch square, gray, 100 dpi.
fn inch_square(session: &mut Session) {
    session.set_option_by_name(names::MODE, "Grayscale").unwrap();
    session.set_option_by_name(names::BR_X, "25.4").unwrap();
    session.set_option_by_name(names::BR_Y, "25.4").unwrap();
}

#[test]
fn test_gray_scan_end_to_end() {
    let mock = scanner();
    let log = mock.log();
    let open_flag = mock.open_flag();

    let mut backend = Backend::new();
    let mut session = open(&mut backend, mock);
    inch_square(&mut session);

    let estimate = session.get_parameters().unwrap();
    assert_eq!(estimate.format, FrameFormat::Gray);
    assert_eq!((estimate.pixels_per_line, estimate.lines), (100, 100));

    session.start().unwrap();
    assert_eq!(session.state(), State::Scanning);
    assert!(open_flag.load(Ordering::SeqCst));

    let params = session.get_parameters().unwrap();
    assert_eq!(params, estimate);
    assert!(params.last_frame);

    let frame = read_frame(&mut session).unwrap();
    assert_eq!(frame, image());
    assert_eq!(session.state(), State::Idle);
    assert!(!open_flag.load(Ordering::SeqCst));

    // TEST UNIT READY, REQUEST SENSE, OBJECT POSITION, SET WINDOW, buffer status,
    // calibration, execute, gamma, SET WINDOW, SCAN
    assert_eq!(
        opcodes(&log)[..10],
        [0x00, 0x03, 0x31, 0x24, 0x34, 0x09, 0x0e, 0x2a, 0x24, 0x1b]
    );
    assert_eq!(opcodes(&log).last(), Some(&0x31));

    let window = log
        .lock()
        .unwrap()
        .iter()
        .find(|exchange| exchange.cdb[0] == 0x24)
        .and_then(|exchange| exchange.data_out.clone())
        .unwrap();
    assert_eq!(window[10..14], [0x00, 0x64, 0x00, 0x64]);
    assert_eq!(window[22..30], [0x00, 0x00, 0x01, 0x2c, 0x00, 0x00, 0x01, 0x2c]);
    assert_eq!(window[33], 0x02);

    session.close().unwrap();
}

#[test]
fn test_options_locked_while_scanning() {
    let mut backend = Backend::new();
    let mut session = open(&mut backend, scanner());
    inch_square(&mut session);

    session.start().unwrap();

    let resolution = session.options().find(names::RESOLUTION).unwrap();
    assert_eq!(
        session.set_option(resolution, OptionValue::Int(200)).map(drop),
        Err(SaneError::DeviceBusy)
    );
    assert_eq!(session.start(), Err(SaneError::DeviceBusy));

    read_frame(&mut session).unwrap();
    assert!(session.set_option(resolution, OptionValue::Int(200)).is_ok());
}

#[test]
fn test_cancel_mid_frame() {
    let mock = scanner();
    let log = mock.log();
    let open_flag = mock.open_flag();

    let mut backend = Backend::new();
    let mut session = open(&mut backend, mock);
    inch_square(&mut session);

    session.start().unwrap();

    let mut buf = [0u8; 10];
    assert_eq!(session.read(&mut buf), Ok(10));
    assert_eq!(session.state(), State::Draining);

    session.cancel();
    assert_eq!(session.state(), State::Cancelled);
    assert_eq!(session.read(&mut buf), Err(SaneError::Cancelled));
    assert!(!open_flag.load(Ordering::SeqCst));
    assert_eq!(opcodes(&log).last(), Some(&0x31));

    assert_eq!(session.close(), Ok(()));
}

#[test]
fn test_new_scan_after_cancel() {
    let mock = scanner();
    let log = mock.log();

    let mut backend = Backend::new();
    let mut session = open(&mut backend, mock);
    inch_square(&mut session);

    session.start().unwrap();
    assert_eq!(session.read(&mut [0u8; 10]), Ok(10));
    session.cancel();

    // A new scan starts from scratch.
    session.start().unwrap();
    assert_eq!(read_frame(&mut session).unwrap().len(), 10_000);
    assert_eq!(count(&log, 0x1b), 2);
    assert_eq!(session.close(), Ok(()));
}

#[test]
fn test_busy_device_waited_for() {
    let mut mock = scanner();
    for _ in 0..3 {
        mock.push_check_condition(&[0x00], MockTransport::sense(0x02, 0x00, 0x00));
    }

    let sleeper = RecordingSleeper::default();
    let mut backend = Backend::new();
    let mut session = open(&mut backend, mock).with_sleeper(Box::new(sleeper.clone()));
    inch_square(&mut session);

    session.start().unwrap();

    assert_eq!(session.last_wait_retries(), 3);
    assert_eq!(sleeper.delays(), vec![Duration::from_secs(1); 3]);
}

#[test]
fn test_empty_buffer_rejected() {
    let mut backend = Backend::new();
    let mut session = open(&mut backend, scanner());
    inch_square(&mut session);

    assert_eq!(session.read(&mut [0u8; 4]), Err(SaneError::Inval));

    session.start().unwrap();
    assert_eq!(session.read(&mut []), Err(SaneError::Inval));
}

#[test]
fn test_failing_transport_ends_scan() {
    let mut mock = scanner();
    mock.push_io_error(&[0x28]);
    let open_flag = mock.open_flag();

    let mut backend = Backend::new();
    let mut session = open(&mut backend, mock);
    inch_square(&mut session);

    session.start().unwrap();
    assert_eq!(read_frame(&mut session), Err(SaneError::IO));
    assert_eq!(session.state(), State::Idle);
    assert!(!open_flag.load(Ordering::SeqCst));
}

#[test]
fn test_overlapped_reader_delivers_frame() {
    let mut backend = Backend::new();
    backend.attach(DEVICE, Box::new(scanner())).unwrap();
    backend
        .set_reader_config(
            DEVICE,
            ReaderConfig {
                overlapped: true,
                buffers: 2,
                buffer_size: 1000,
            },
        )
        .unwrap();

    let mock = scanner();
    let log = mock.log();
    let mut session = backend.open(DEVICE, Box::new(mock)).unwrap();
    inch_square(&mut session);

    session.start().unwrap();
    assert_eq!(read_frame(&mut session).unwrap(), image());
    assert_eq!(session.state(), State::Idle);

    // Ten reads of ten lines each.
    let reads: Vec<usize> = log
        .lock()
        .unwrap()
        .iter()
        .filter(|exchange| exchange.cdb[0] == 0x28)
        .map(|exchange| exchange.read_len)
        .collect();
    assert_eq!(reads, vec![1000; 10]);
}

#[test]
fn test_overlapped_reader_cancelled() {
    let mut backend = Backend::new();
    backend.attach(DEVICE, Box::new(scanner())).unwrap();
    backend
        .set_reader_config(
            DEVICE,
            ReaderConfig {
                overlapped: true,
                buffers: 1,
                buffer_size: 500,
            },
        )
        .unwrap();

    let mock = scanner();
    let open_flag = mock.open_flag();
    let mut session = backend.open(DEVICE, Box::new(mock)).unwrap();
    inch_square(&mut session);

    session.start().unwrap();
    let mut buf = [0u8; 64];
    assert_eq!(session.read(&mut buf), Ok(64));

    session.cancel();
    assert_eq!(session.state(), State::Cancelled);
    assert!(!open_flag.load(Ordering::SeqCst));
    assert_eq!(session.read(&mut buf), Err(SaneError::Cancelled));
    assert_eq!(session.close(), Ok(()));
}

#[test]
fn test_overlapped_cancel_while_device_stalls() {
    let mut mock = scanner();
    mock.reply(&[0x34], empty_buffer_status());
    // Setup and the first block see data, then the device stops delivering.
    mock.push_reply(&[0x34], buffer_status());
    mock.push_reply(&[0x34], buffer_status());

    let mut backend = Backend::new();
    let mut session = open_overlapped(&mut backend, mock, 1, 500);
    inch_square(&mut session);

    session.start().unwrap();
    let mut buf = [0u8; 64];
    assert_eq!(session.read(&mut buf), Ok(64));
    assert_eq!(session.state(), State::Draining);

    thread::sleep(Duration::from_millis(300));

    let started = Instant::now();
    session.cancel();
    assert!(started.elapsed() < Duration::from_secs(2));

    assert_eq!(session.state(), State::Cancelled);
    assert_eq!(session.read(&mut buf), Err(SaneError::Cancelled));
    assert_eq!(session.close(), Ok(()));
}

#[test]
fn test_reader_panic_leaves_session_cancelled() {
    let mut mock = scanner();
    mock.push_panic(&[0x28]);

    let mut backend = Backend::new();
    let mut session = open_overlapped(&mut backend, mock, 2, 1000);
    inch_square(&mut session);

    session.start().unwrap();
    assert_eq!(read_frame(&mut session), Err(SaneError::IO));
    assert_eq!(session.state(), State::Cancelled);

    // The link went down with the worker, the device cannot be driven any more.
    assert_eq!(session.start(), Err(SaneError::IO));
    assert_eq!(session.state(), State::Cancelled);
    assert_eq!(session.close(), Ok(()));
}

/// Two pixels wide, four lines, device without RAM extension at 100 dpi: the
/// sensor lags green one line and red two lines behind blue.
#[test]
fn test_colour_rasters_reordered() {
    const R: u8 = 0;
    const G: u8 = 1;
    const B: u8 = 2;

    let raster = |line: u8, colour: u8| [line * 16 + colour * 4, line * 16 + colour * 4 + 1];

    let order = [
        (0, B),
        (1, B),
        (0, G),
        (2, B),
        (1, G),
        (0, R),
        (3, B),
        (2, G),
        (1, R),
        (3, G),
        (2, R),
        (3, R),
    ];
    let raw: Vec<u8> = order.iter().flat_map(|&(line, colour)| raster(line, colour)).collect();

    let mut status = vec![0u8; 0x12];
    status[9..12].copy_from_slice(&[0x00, 0x00, 0x18]);
    status[12..14].copy_from_slice(&[0x00, 0x04]);
    status[14..16].copy_from_slice(&[0x00, 0x02]);
    status[17] = 0x07;

    let mut mock = scanner();
    mock.reply(&[0x34], status);
    mock.reply(&[0x28], raw);

    let mut backend = Backend::new();
    let mut session = open(&mut backend, mock);
    session.set_option_by_name(names::MODE, "Color").unwrap();
    session.set_option_by_name(names::RESOLUTION, "100").unwrap();
    session.set_option_by_name(names::BR_X, "25.4").unwrap();
    session.set_option_by_name(names::BR_Y, "25.4").unwrap();

    session.start().unwrap();
    let params = session.get_parameters().unwrap();
    assert_eq!(params.format, FrameFormat::RGB);
    assert_eq!((params.pixels_per_line, params.lines, params.bytes_per_line), (2, 4, 6));

    let frame = read_frame(&mut session).unwrap();
    assert_eq!(
        frame,
        vec![
            0x00, 0x04, 0x08, 0x01, 0x05, 0x09, //
            0x10, 0x14, 0x18, 0x11, 0x15, 0x19, //
            0x20, 0x24, 0x28, 0x21, 0x25, 0x29, //
            0x30, 0x34, 0x38, 0x31, 0x35, 0x39,
        ]
    );
    assert_eq!(frame.len() / params.bytes_per_line, 4);
    assert_eq!(session.state(), State::Idle);
}
