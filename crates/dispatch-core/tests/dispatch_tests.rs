//! End-to-end tests for the dispatch core
//!
//! These tests drive a full dispatcher (config provider, operator pool,
//! queue and recorders) through the public API only.

use anyhow::Result;
use callcenter_dispatch_core::prelude::*;
use serial_test::serial;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

const UNIT: Duration = Duration::from_millis(1);

struct Harness {
    dispatcher: Arc<Dispatcher>,
    config: Arc<StaticConfig>,
    records: Arc<MemoryRecorder>,
}

fn harness(settings: DispatchSettings, unit: Duration) -> Result<Harness> {
    let config = Arc::new(StaticConfig::new(settings));
    let records = Arc::new(MemoryRecorder::new());
    let system = DispatcherBuilder::new()
        .with_config(config.clone())
        .with_recorder(records.clone())
        .with_service_unit(unit)
        .build()?;
    Ok(Harness {
        dispatcher: system.dispatcher,
        config,
        records,
    })
}

fn settings(r_min: u32, r_max: u32, operators: usize, queue_size: usize) -> DispatchSettings {
    DispatchSettings {
        r_min,
        r_max,
        operators,
        queue_size,
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
#[serial]
fn test_thousand_concurrent_callers() -> Result<()> {
    let h = harness(settings(1, 2, 4, 500), Duration::from_micros(100))?;
    h.dispatcher.start_thread_pool();

    let callers: Vec<_> = (0..10)
        .map(|caller| {
            let dispatcher = h.dispatcher.clone();
            thread::spawn(move || {
                (0..100)
                    .map(|n| {
                        let number = format!("8916{:03}{:04}", caller, n);
                        let (id, future) = dispatcher.submit(&number).unwrap();
                        (id, future.wait().unwrap())
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut ids = HashSet::new();
    for caller in callers {
        for (id, result) in caller.join().unwrap() {
            assert_eq!(result.call_id, id);
            assert!(
                matches!(result.status, CallStatus::Completed | CallStatus::Timeout),
                "call {} ended as {}",
                id,
                result.status
            );
            assert!(ids.insert(id), "call id {} issued twice", id);
        }
    }

    assert_eq!(ids.len(), 1000);
    assert!(wait_until(|| h.records.len() == 1000));
    Ok(())
}

#[test]
#[serial]
fn test_thousand_simultaneous_submissions() -> Result<()> {
    let h = harness(settings(1, 2, 4, 1000), Duration::from_micros(100))?;
    let gate = Arc::new(Barrier::new(1000));

    let submitters: Vec<_> = (0..1000)
        .map(|n| {
            let dispatcher = h.dispatcher.clone();
            let gate = gate.clone();
            thread::Builder::new()
                .name(format!("caller-{}", n))
                .stack_size(256 * 1024)
                .spawn(move || {
                    gate.wait();
                    dispatcher.submit(&format!("8926{:06}", n))
                })
        })
        .collect::<std::io::Result<_>>()?;

    let mut ids = HashSet::new();
    let mut futures = Vec::with_capacity(1000);
    for submitter in submitters {
        let (id, future) = submitter.join().expect("submitter panicked")?;
        assert!(ids.insert(id), "call id {} issued twice", id);
        futures.push((id, future));
    }
    assert_eq!(ids.len(), 1000);
    assert_eq!(h.dispatcher.queued(), 1000);

    h.dispatcher.start_thread_pool();
    for (id, future) in futures {
        let result = future.wait()?;
        assert_eq!(result.call_id, id);
        assert!(
            matches!(result.status, CallStatus::Completed | CallStatus::Timeout),
            "call {} ended as {}",
            id,
            result.status
        );
    }
    assert!(wait_until(|| h.records.len() == 1000));
    Ok(())
}

#[test]
fn test_reconfigure_to_single_operator_services_queue() -> Result<()> {
    let h = harness(settings(1, 5, 4, 50), UNIT)?;

    let futures: Vec<_> = (0..8)
        .map(|i| h.dispatcher.submit(&format!("7000{}", i)))
        .collect::<std::result::Result<_, _>>()?;
    assert_eq!(h.dispatcher.queued(), 8);

    h.config.set(settings(1, 5, 1, 50));
    assert!(h.dispatcher.request_reconfigure());
    assert_eq!(h.dispatcher.pool_size(), 1);
    assert_eq!(h.dispatcher.queued(), 8);

    h.dispatcher.start_thread_pool();
    for (id, future) in futures {
        let result = future.wait()?;
        assert_eq!(result.call_id, id);
        assert!(matches!(result.status, CallStatus::Completed | CallStatus::Timeout));
    }
    Ok(())
}

#[test]
fn test_hot_swap_while_calls_in_flight() -> Result<()> {
    let h = harness(settings(20, 30, 2, 50), UNIT)?;
    h.dispatcher.start_thread_pool();

    let futures: Vec<_> = (0..6)
        .map(|i| h.dispatcher.submit(&format!("5100{}", i)))
        .collect::<std::result::Result<_, _>>()?;

    // two calls are on the line, four are waiting
    thread::sleep(Duration::from_millis(5));
    h.config.set(settings(20, 30, 3, 50));
    assert!(h.dispatcher.request_reconfigure());
    assert_eq!(h.dispatcher.pool_size(), 3);

    let mut seen = HashSet::new();
    for (id, future) in futures {
        let result = future.wait()?;
        assert!(seen.insert(result.call_id));
        assert_eq!(result.call_id, id);
    }
    assert!(wait_until(|| h.records.len() == 6));
    Ok(())
}

#[test]
fn test_call_waiting_past_upper_bound_times_out() -> Result<()> {
    let h = harness(settings(1, 2, 2, 20), Duration::from_millis(10))?;

    let (id, future) = h.dispatcher.submit("89160000000")?;
    thread::sleep(Duration::from_millis(30));
    h.dispatcher.start_thread_pool();

    let result = future.wait()?;
    assert_eq!(result.status, CallStatus::Timeout);
    assert_eq!(result.call_duration, Duration::ZERO);
    assert_eq!(result.call_id, id);

    assert!(wait_until(|| h.records.len() == 1));
    let cdr = &h.records.records()[0];
    assert_eq!(cdr.status, CallStatus::Timeout);
    assert!(cdr.operator_id != 0);
    assert!(cdr.to_record_line().ends_with(";0s"));
    Ok(())
}

#[test]
fn test_every_call_resolves_exactly_once() -> Result<()> {
    let h = harness(settings(1, 3, 2, 4), UNIT)?;

    // stopped pool: 4 admitted, one duplicate evicted, the rest overloaded
    let numbers = ["1", "2", "3", "1", "4", "5", "6"];
    let mut futures = Vec::new();
    for number in numbers {
        futures.push(h.dispatcher.submit(number)?);
    }

    h.dispatcher.start_thread_pool();

    let mut statuses: HashMap<CallStatus, usize> = HashMap::new();
    for (id, future) in futures {
        let result = future.wait()?;
        assert_eq!(result.call_id, id);
        *statuses.entry(result.status).or_default() += 1;
    }

    assert_eq!(statuses.get(&CallStatus::Duplication), Some(&1));
    assert_eq!(statuses.get(&CallStatus::Overloaded), Some(&2));
    let serviced = statuses.get(&CallStatus::Completed).copied().unwrap_or(0)
        + statuses.get(&CallStatus::Timeout).copied().unwrap_or(0);
    assert_eq!(serviced, 4);

    assert!(wait_until(|| h.records.len() == numbers.len()));
    let mut recorded: Vec<CallId> = h.records.records().iter().map(|r| r.call_id).collect();
    recorded.sort_unstable();
    recorded.dedup();
    assert_eq!(recorded.len(), numbers.len());
    Ok(())
}

#[tokio::test]
async fn test_results_can_be_awaited() -> Result<()> {
    let h = harness(settings(1, 5, 2, 20), UNIT)?;
    h.dispatcher.start_thread_pool();

    let (_, first) = h.dispatcher.submit("100")?;
    let (_, second) = h.dispatcher.submit("200")?;
    let (a, b) = tokio::join!(first, second);
    assert!(a.is_ok());
    assert!(b.is_ok());
    Ok(())
}

#[test]
fn test_dropping_dispatcher_rejects_waiting_calls() -> Result<()> {
    let h = harness(settings(1, 5, 2, 20), UNIT)?;
    let (_, future) = h.dispatcher.submit("300")?;

    let Harness {
        dispatcher,
        config,
        records,
    } = h;
    drop(dispatcher);
    drop(config);

    let result = future.wait()?;
    assert_eq!(result.status, CallStatus::Rejected);
    assert_eq!(records.records()[0].status, CallStatus::Rejected);
    Ok(())
}

#[test]
fn test_cdr_file_receives_every_call() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config_path = dir.path().join("base.json");
    std::fs::write(
        &config_path,
        r#"{"RMin": 4, "RMax": 5, "AmountOfOperators": 2, "SizeOfQueue": 15}"#,
    )?;
    let cdr_path = dir.path().join("cdrFile.txt");

    let system = DispatcherBuilder::new()
        .with_config_file(&config_path)
        .with_cdr_file(&cdr_path)
        .with_service_unit(UNIT)
        .without_monitor()
        .build()?;
    system.dispatcher.start_thread_pool();

    let (_, a) = system.dispatcher.submit("111")?;
    let (_, b) = system.dispatcher.submit("222")?;
    a.wait()?;
    b.wait()?;

    assert!(wait_until(|| {
        std::fs::read_to_string(&cdr_path)
            .map(|text| text.lines().count() == 5)
            .unwrap_or(false)
    }));
    let text = std::fs::read_to_string(&cdr_path)?;
    let lines: Vec<&str> = text.lines().skip(3).collect();
    assert!(lines.iter().any(|l| l.contains(";111;")));
    assert!(lines.iter().all(|l| l.split(';').count() == 8));
    Ok(())
}
