#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use common::{MIB, mem_device_sized};
use pagefs::block::{Bio, submit_and_wait};

#[test]
fn read_bio_completes_once_with_prior_content() {
    let dev = mem_device_sized(64 * MIB);
    dev.write_at(0, &vec![0xABu8; 4096]).unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let fired_in_cb = Arc::clone(&fired);
    let (outcome, data) = submit_and_wait(&*dev, move |done| {
        Bio::read(
            0,
            1024,
            Box::new(move |outcome, data| {
                fired_in_cb.fetch_add(1, Ordering::SeqCst);
                done(outcome, data);
            }),
        )
    });

    assert_eq!(outcome.unwrap(), 1024);
    assert_eq!(fired.load(Ordering::SeqCst), 1, "completion fires exactly once");
    let buf = data.into_read().expect("read bio hands its buffer back");
    assert!(buf.iter().all(|&b| b == 0xAB));
}

#[test]
fn write_bio_lands_on_the_device() {
    let dev = mem_device_sized(MIB);
    let (outcome, _) = submit_and_wait(&*dev, |done| {
        Bio::write(4, Bytes::from(vec![0x7Eu8; 2048]), done)
    });
    assert_eq!(outcome.unwrap(), 2048);

    let mut got = vec![0u8; 2048];
    dev.read_at(4, &mut got).unwrap();
    assert!(got.iter().all(|&b| b == 0x7E));
}

#[test]
fn completions_fire_in_submission_order() {
    let dev = mem_device_sized(MIB);
    let order = Arc::new(Mutex::new(Vec::new()));

    for i in 0..32u64 {
        let order = Arc::clone(&order);
        dev.submit_bio(Bio::write(
            i,
            Bytes::from(vec![i as u8; 512]),
            Box::new(move |outcome, _| {
                outcome.unwrap();
                order.lock().unwrap().push(i);
            }),
        ));
    }
    // A flush bio after the writes acts as a barrier to wait on.
    let (outcome, _) = submit_and_wait(&*dev, Bio::flush);
    outcome.unwrap();

    let got = order.lock().unwrap().clone();
    let expected: Vec<u64> = (0..32).collect();
    assert_eq!(got, expected, "single submitter sees submission order");
}

#[test]
fn discard_bio_zero_fills() {
    let dev = mem_device_sized(MIB);
    dev.write_at(0, &[0xFFu8; 1024]).unwrap();

    let (outcome, _) = submit_and_wait(&*dev, |done| Bio::discard(0, 1024, done));
    outcome.unwrap();

    let mut got = [0u8; 1024];
    dev.read_at(0, &mut got).unwrap();
    assert!(got.iter().all(|&b| b == 0));
}

#[test]
fn queued_bios_complete_before_device_destruction() {
    let completions = Arc::new(AtomicUsize::new(0));
    {
        let dev = mem_device_sized(MIB);
        for i in 0..64u64 {
            let completions = Arc::clone(&completions);
            dev.submit_bio(Bio::write(
                i,
                Bytes::from(vec![1u8; 512]),
                Box::new(move |_, _| {
                    // Stagger the worker a little so the queue is nonempty
                    // when the device is dropped.
                    std::thread::sleep(Duration::from_micros(100));
                    completions.fetch_add(1, Ordering::SeqCst);
                }),
            ));
        }
        // Device dropped here with bios still queued.
    }
    assert_eq!(
        completions.load(Ordering::SeqCst),
        64,
        "destruction drains the queue and joins the worker"
    );
}

#[test]
fn read_bio_on_bogus_sector_reports_the_error() {
    let dev = mem_device_sized(MIB);
    let sectors = MIB / u64::from(dev.sector_size());
    let (outcome, _) = submit_and_wait(&*dev, |done| Bio::read(sectors + 1, 512, done));
    assert!(outcome.is_err());
}
