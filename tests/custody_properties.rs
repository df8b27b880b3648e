//! Concurrency properties of the custody layer, checked with instrumented
//! threads: mutual exclusion per stage, FIFO service order, and cleanup on
//! every exit path.

use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use scope_core::custody::{Custody, CustodyThread, Resource};
use scope_core::error::ScopeError;

/// Recorded hold interval of one thread on one resource.
#[derive(Clone, Copy)]
struct Hold {
    thread: u64,
    start: Instant,
    end: Instant,
}

fn overlapping(holds: &[Hold]) -> Option<(u64, u64)> {
    for (i, a) in holds.iter().enumerate() {
        for b in &holds[i + 1..] {
            if a.start < b.end && b.start < a.end {
                return Some((a.thread, b.thread));
            }
        }
    }
    None
}

#[test]
fn holds_on_one_resource_never_overlap() {
    let stage = Resource::new("exclusive");
    let holds: Arc<Mutex<Vec<Hold>>> = Arc::new(Mutex::new(Vec::new()));

    let mut threads = Vec::new();
    for thread_id in 0..16u64 {
        let stage = stage.clone();
        let holds = holds.clone();
        threads.push(
            CustodyThread::spawn("holder", Some(&stage.clone()), move |custody| {
                custody.wait_in_line();
                let start = Instant::now();
                thread::sleep(Duration::from_millis(3));
                let end = Instant::now();
                custody.switch_from(Some(&stage), None);
                holds.lock().push(Hold {
                    thread: thread_id,
                    start,
                    end,
                });
                Ok(())
            })
            .expect("spawn"),
        );
    }
    for th in threads {
        th.result().expect("holder failed");
    }

    let recorded = holds.lock();
    assert_eq!(recorded.len(), 16);
    if let Some((a, b)) = overlapping(&recorded) {
        panic!("threads {a} and {b} held the resource simultaneously");
    }
}

#[test]
fn chain_order_is_preserved_across_two_stages() {
    let first = Resource::new("first");
    let second = Resource::new("second");
    let order: Arc<Mutex<Vec<(char, u64)>>> = Arc::new(Mutex::new(Vec::new()));

    let mut threads = Vec::new();
    for i in 0..6u64 {
        let first = first.clone();
        let second = second.clone();
        let order = order.clone();
        threads.push(
            CustodyThread::spawn("walker", Some(&first.clone()), move |custody| {
                custody.wait_in_line();
                order.lock().push(('f', i));
                thread::sleep(Duration::from_millis(2));
                custody.switch_from(Some(&first), Some(&second));
                order.lock().push(('s', i));
                custody.switch_from(Some(&second), None);
                Ok(())
            })
            .expect("spawn"),
        );
        // Make the launch order unambiguous.
        thread::sleep(Duration::from_millis(1));
    }
    for th in threads {
        th.result().expect("walker failed");
    }

    let entries = order.lock();
    let firsts: Vec<u64> = entries.iter().filter(|e| e.0 == 'f').map(|e| e.1).collect();
    let seconds: Vec<u64> = entries.iter().filter(|e| e.0 == 's').map(|e| e.1).collect();
    assert_eq!(firsts, (0..6).collect::<Vec<_>>());
    assert_eq!(seconds, (0..6).collect::<Vec<_>>());
}

#[test]
fn errors_and_panics_never_leave_a_stage_held() {
    let stage = Resource::new("stage");

    let erroring = {
        let stage = stage.clone();
        CustodyThread::spawn("errs", Some(&stage.clone()), move |custody| {
            custody.wait_in_line();
            let _ = &stage;
            Err::<(), _>(ScopeError::Aborted("injected failure".into()))
        })
        .expect("spawn")
    };
    assert!(erroring.result().is_err());

    let panicking = {
        let stage = stage.clone();
        CustodyThread::spawn("panics", Some(&stage.clone()), move |custody| -> scope_core::CoreResult<()> {
            custody.wait_in_line();
            let _ = &stage;
            panic!("injected panic")
        })
        .expect("spawn")
    };
    let err = panicking.result().expect_err("panic must surface");
    assert!(err.to_string().contains("injected panic"));
    assert!(err.remote_traceback().is_some());

    // Both exits released the stage; a fresh thread acquires immediately.
    let follower = {
        let stage = stage.clone();
        CustodyThread::spawn("follows", Some(&stage.clone()), move |custody| {
            custody
                .switch_from_timeout(None, Some(&stage), Duration::from_millis(200))
                .map(|()| true)
        })
        .expect("spawn")
    };
    assert!(follower.result().expect("stage still held"));
    assert_eq!(stage.queue_len(), 0);
}

#[test]
fn timeout_caller_leaves_no_queue_residue() {
    let stage = Resource::new("slow");
    let mut holder = Custody::new();
    holder.switch_from(None, Some(&stage));

    let blocked = {
        let stage = stage.clone();
        CustodyThread::spawn("blocked", None, move |custody| {
            custody.switch_from_timeout(None, Some(&stage), Duration::from_millis(30))
        })
        .expect("spawn")
    };
    let err = blocked.result().expect_err("must time out");
    assert!(matches!(err, ScopeError::CustodyTimeout { .. }));

    // Only the holder remains in line.
    assert_eq!(stage.queue_len(), 1);
    holder.release();
    assert_eq!(stage.queue_len(), 0);
}
