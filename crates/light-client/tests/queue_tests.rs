//! Tests for the execution queue

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use lightcore_light_client::ExecQueue;
use parking_lot::Mutex;

/// Enqueue a task that reports when it starts and then blocks until released
fn hold_consumer(queue: &ExecQueue) -> mpsc::Sender<()> {
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    assert!(queue.enqueue(move |_| {
        started_tx.send(()).unwrap();
        let _ = release_rx.recv();
    }));
    started_rx.recv().unwrap();
    release_tx
}

#[test]
fn test_tasks_run_in_order() {
    let queue = ExecQueue::new(256).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let active = Arc::new(AtomicUsize::new(0));
    let overlap = Arc::new(AtomicBool::new(false));

    for i in 0..200 {
        let seen = seen.clone();
        let active = active.clone();
        let overlap = overlap.clone();
        assert!(queue.enqueue(move |_| {
            if active.fetch_add(1, Ordering::SeqCst) != 0 {
                overlap.store(true, Ordering::SeqCst);
            }
            seen.lock().push(i);
            active.fetch_sub(1, Ordering::SeqCst);
        }));
    }
    let (done_tx, done_rx) = mpsc::channel();
    assert!(queue.enqueue(move |_| done_tx.send(()).unwrap()));
    done_rx.recv().unwrap();

    assert_eq!(*seen.lock(), (0..200).collect::<Vec<_>>());
    assert!(!overlap.load(Ordering::SeqCst));
    queue.close();
}

#[test]
fn test_capacity_counts_running_task() {
    let queue = ExecQueue::new(3).unwrap();
    let release = hold_consumer(&queue);

    assert!(queue.can_queue());
    assert!(queue.enqueue(|_| {}));
    assert!(queue.enqueue(|_| {}));
    assert!(!queue.can_queue());
    assert!(!queue.enqueue(|_| {}));
    assert!(queue.try_enqueue(Box::new(|_| {})).is_err());
    assert_eq!(queue.queued(), 2);

    release.send(()).unwrap();
    let (done_tx, done_rx) = mpsc::channel();
    let mut task: lightcore_light_client::Task<()> = Box::new(move |_| done_tx.send(()).unwrap());
    loop {
        match queue.try_enqueue(task) {
            Ok(()) => break,
            Err(refused) => {
                task = refused;
                thread::sleep(Duration::from_millis(1));
            }
        }
    }
    done_rx.recv().unwrap();
    queue.close();
}

#[test]
fn test_clear_drops_queued_tasks() {
    let queue = ExecQueue::new(16).unwrap();
    let ran = Arc::new(AtomicUsize::new(0));
    let release = hold_consumer(&queue);

    for _ in 0..3 {
        let ran = ran.clone();
        assert!(queue.enqueue(move |_| {
            ran.fetch_add(1, Ordering::SeqCst);
        }));
    }
    assert_eq!(queue.clear(), 3);
    assert_eq!(queue.queued(), 0);

    release.send(()).unwrap();
    let (done_tx, done_rx) = mpsc::channel();
    assert!(queue.enqueue(move |_| done_tx.send(()).unwrap()));
    done_rx.recv().unwrap();

    assert_eq!(ran.load(Ordering::SeqCst), 0);
    queue.close();
}

#[test]
fn test_close_finishes_running_task_and_drops_rest() {
    let queue = ExecQueue::new(16).unwrap();
    let ran = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicBool::new(false));

    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    {
        let finished = finished.clone();
        assert!(queue.enqueue(move |_| {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv();
            thread::sleep(Duration::from_millis(20));
            finished.store(true, Ordering::SeqCst);
        }));
    }
    started_rx.recv().unwrap();
    for _ in 0..5 {
        let ran = ran.clone();
        assert!(queue.enqueue(move |_| {
            ran.fetch_add(1, Ordering::SeqCst);
        }));
    }

    let closer = {
        let queue = queue.clone();
        thread::spawn(move || queue.close())
    };
    while !queue.is_closed() {
        thread::sleep(Duration::from_millis(1));
    }
    assert!(!queue.enqueue(|_| {}));
    release_tx.send(()).unwrap();
    closer.join().unwrap();

    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(ran.load(Ordering::SeqCst), 0);

    // Second close returns without effect
    queue.close();
    assert!(!queue.begin_close());
    assert!(!queue.can_queue());
}

#[test]
fn test_dropped_tasks_release_captures() {
    let queue = ExecQueue::new(16).unwrap();
    let release = hold_consumer(&queue);
    let (tx, rx) = mpsc::channel::<()>();
    assert!(queue.enqueue(move |_| drop(tx)));

    queue.begin_close();
    release.send(()).unwrap();

    // The sender is dropped with the task, never sent on
    assert!(rx.recv().is_err());
    queue.close();
}
