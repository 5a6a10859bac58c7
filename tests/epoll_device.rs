use std::{
    fs::File,
    io::Write,
    os::fd::OwnedFd,
    thread,
    time::Duration,
};

use evaio::{
    codec::{encode, RawRecord},
    Device, DeviceError, DeviceOptions, Lifecycle, Runtime,
};
use nix::unistd::pipe;

fn record(type_code: u16, code: u16, value: i32) -> RawRecord {
    RawRecord {
        seconds: 1000,
        microseconds: 500_000,
        type_code,
        code,
        value,
    }
}

fn pipe_device(rt: &Runtime) -> (Device, File) {
    let (rx, tx): (OwnedFd, OwnedFd) = pipe().unwrap();
    let device = Device::from_fd(rt.watcher(), rx, DeviceOptions::default()).unwrap();
    (device, File::from(tx))
}

#[test]
fn reads_records_written_later() {
    let rt = Runtime::new().unwrap();
    let (device, mut writer) = pipe_device(&rt);

    let feeder = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        writer.write_all(&encode(&record(1, 30, 1))).unwrap();
        thread::sleep(Duration::from_millis(20));
        writer.write_all(&encode(&record(0, 0, 0))).unwrap();
    });

    let (first, second) = rt
        .block_on(async {
            let first = device.get().await;
            let second = device.get().await;
            (first, second)
        })
        .unwrap();
    feeder.join().unwrap();

    let first = first.unwrap();
    assert_eq!(first.kind, Some("KEY"));
    assert_eq!(first.code, 30);
    assert_eq!(first.value, 1);
    assert_eq!(first.timestamp, 1000.5);
    assert_eq!(second.unwrap().kind, Some("SYN"));

    assert_eq!(device.lifecycle(), Lifecycle::Open);
    assert!(rt.watcher().is_empty());
}

#[test]
fn writer_hangup_closes_device() {
    let rt = Runtime::new().unwrap();
    let (device, writer) = pipe_device(&rt);

    let feeder = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        drop(writer);
    });

    let outcome = rt.block_on(device.get()).unwrap();
    feeder.join().unwrap();

    assert_eq!(outcome, Err(DeviceError::Closed));
    assert_eq!(device.lifecycle(), Lifecycle::Closed);
    assert_eq!(device.close(), Err(DeviceError::AlreadyClosed));
    assert!(rt.watcher().is_empty());
}

#[test]
fn queued_records_drain_before_parking() {
    let rt = Runtime::new().unwrap();
    let (device, mut writer) = pipe_device(&rt);

    for code in [16u16, 17, 18] {
        writer.write_all(&encode(&record(1, code, 1))).unwrap();
    }

    let codes = rt
        .block_on(async {
            let mut codes = Vec::new();
            for _ in 0..3 {
                codes.push(device.get().await.unwrap().code);
            }
            codes
        })
        .unwrap();

    assert_eq!(codes, [16, 17, 18]);
    device.close().unwrap();
}

#[test]
fn sibling_task_interrupts_pending_read() {
    let rt = Runtime::new().unwrap();
    let (device, _writer) = pipe_device(&rt);
    let interrupter = device.interrupter();

    let outcome = rt
        .block_on(async {
            let get = device.get();
            rt.spawn(async move {
                interrupter.interrupt().unwrap();
            });
            get.await
        })
        .unwrap();

    assert_eq!(outcome, Err(DeviceError::Interrupted));
    assert_eq!(device.lifecycle(), Lifecycle::Open);
    device.close().unwrap();
}
