//! Permission latch integration tests
//!
//! Exercises the one-shot latch across threads and runtimes.
//!
//! # Test Scenarios
//! - Many latches resolved concurrently from worker threads
//! - Timeouts racing late signals
//! - Blocking and async waits side by side
//!
//! Run with: `cargo test -p common --test permission_latch_tests`

use common::test_utils::{DEFAULT_TEST_TIMEOUT, create_mock_record_list, join_with_timeout};
use common::{Error, permission_latch};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

// ============================================================================
// Concurrency Tests
// ============================================================================

#[test]
fn test_many_latches_across_threads() {
    let devices = create_mock_record_list(16);
    let released = Arc::new(AtomicUsize::new(0));

    let mut waiters = Vec::new();
    let mut signals = Vec::new();
    for device in &devices {
        let (signal, waiter) = permission_latch(device.key());
        signals.push(signal);

        let released = released.clone();
        waiters.push(thread::spawn(move || {
            waiter.wait(Some(DEFAULT_TEST_TIMEOUT)).unwrap();
            released.fetch_add(1, Ordering::SeqCst);
        }));
    }

    // Release in reverse order from a single delivery thread
    let delivery = thread::spawn(move || {
        for signal in signals.into_iter().rev() {
            assert!(signal.signal());
        }
    });
    join_with_timeout(delivery, DEFAULT_TEST_TIMEOUT).unwrap();

    for waiter in waiters {
        join_with_timeout(waiter, DEFAULT_TEST_TIMEOUT).unwrap();
    }
    assert_eq!(released.load(Ordering::SeqCst), devices.len());
}

#[test]
fn test_late_signal_after_timeout() {
    let (signal, waiter) = permission_latch("/dev/bus/usb/001/002");

    let started = Instant::now();
    let result = waiter.wait(Some(Duration::from_millis(30)));
    assert!(matches!(result, Err(Error::PermissionTimeout(ref d)) if d == "/dev/bus/usb/001/002"));
    assert!(started.elapsed() >= Duration::from_millis(30));

    // Nobody is listening any more
    assert!(!signal.signal());
}

#[test]
fn test_cancel_from_other_thread() {
    let (signal, waiter) = permission_latch("/dev/bus/usb/001/003");

    let waiting = thread::spawn(move || waiter.wait(None));
    thread::sleep(Duration::from_millis(10));
    drop(signal);

    let result = join_with_timeout(waiting, DEFAULT_TEST_TIMEOUT).unwrap();
    assert!(matches!(result, Err(Error::PermissionCancelled(_))));
}

#[tokio::test]
async fn test_async_wait_with_blocking_signal() {
    let (signal, waiter) = permission_latch("/dev/bus/usb/002/007");

    let delivery = tokio::task::spawn_blocking(move || {
        thread::sleep(Duration::from_millis(10));
        signal.signal()
    });

    waiter.wait_async(Some(DEFAULT_TEST_TIMEOUT)).await.unwrap();
    assert!(delivery.await.unwrap());
}

#[tokio::test]
async fn test_async_timeout() {
    let (_signal, waiter) = permission_latch("/dev/bus/usb/002/008");

    let result = waiter.wait_async(Some(Duration::from_millis(20))).await;
    assert!(matches!(result, Err(Error::PermissionTimeout(_))));
}
