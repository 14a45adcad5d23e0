use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use modbus_transport::TransportError;
use poller::{MetricsSink, PollingScheduler, RegisterSource, SchedulerConfig};
use sunspec_models::meter_bindings;

#[derive(Default)]
struct BusLog {
    connects: usize,
    reads: Vec<(u16, u16)>,
}

/// Bus fake driven by a scripted read queue. Once the script runs out it
/// flips the shutdown signal so the scheduler winds down deterministically.
struct ScriptedBus {
    log: Arc<Mutex<BusLog>>,
    connect_failures: usize,
    reads: VecDeque<Result<Vec<u16>, ()>>,
    shutdown: Option<watch::Sender<bool>>,
}

impl RegisterSource for ScriptedBus {
    async fn connect(&mut self) -> Result<(), TransportError> {
        self.log.lock().unwrap().connects += 1;
        if self.connect_failures > 0 {
            self.connect_failures -= 1;
            return Err(TransportError::Timeout { timeout_ms: 10_000 });
        }
        Ok(())
    }

    async fn close(&mut self) {}

    async fn read(&mut self, start: u16, count: u16) -> Result<Vec<u16>, TransportError> {
        self.log.lock().unwrap().reads.push((start, count));
        match self.reads.pop_front() {
            Some(Ok(registers)) => Ok(registers),
            Some(Err(())) => Err(TransportError::Timeout { timeout_ms: 10_000 }),
            None => {
                if let Some(shutdown) = &self.shutdown {
                    let _ = shutdown.send(true);
                }
                Err(TransportError::NotConnected)
            }
        }
    }
}

#[derive(Clone, Default)]
struct RecordingSink(Arc<Mutex<Vec<(String, f64)>>>);

impl MetricsSink for RecordingSink {
    fn publish(&self, name: &str, value: f64) {
        self.0.lock().unwrap().push((name.to_string(), value));
    }
}

impl RecordingSink {
    fn names(&self) -> Vec<String> {
        self.0.lock().unwrap().iter().map(|(name, _)| name.clone()).collect()
    }
}

fn test_config() -> SchedulerConfig {
    SchedulerConfig {
        poll_interval: Duration::from_secs(5),
        retry_delay: Duration::from_secs(7),
    }
}

#[tokio::test(start_paused = true)]
async fn failed_connects_retry_with_fixed_delay_and_publish_nothing() {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let log = Arc::new(Mutex::new(BusLog::default()));
    let bus = ScriptedBus {
        log: Arc::clone(&log),
        connect_failures: 3,
        reads: VecDeque::new(),
        shutdown: Some(shutdown_tx),
    };
    let sink = RecordingSink::default();

    let scheduler =
        PollingScheduler::new(bus, Vec::new(), sink.clone(), test_config(), shutdown_rx);
    let started = Instant::now();
    scheduler.run().await;
    let elapsed = started.elapsed();

    let log = log.lock().unwrap();
    // Three failed attempts, each followed by the 7s retry delay, then one
    // successful connect whose identification read ends the script.
    assert_eq!(log.connects, 4);
    assert_eq!(log.reads.len(), 1);
    assert!(elapsed >= Duration::from_secs(21));
    assert!(elapsed < Duration::from_secs(22));
    assert!(sink.names().is_empty());
}

#[tokio::test(start_paused = true)]
async fn meter_decode_failure_does_not_suppress_inverter_sample() {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let log = Arc::new(Mutex::new(BusLog::default()));
    let bus = ScriptedBus {
        log: Arc::clone(&log),
        connect_failures: 0,
        reads: VecDeque::from(vec![
            Ok(inverter_common_regs()),
            Ok(meter_common_regs()),
            Ok(inverter_telemetry_regs()),
            // Zeroed block: right length, wrong model id, decode fails.
            Ok(vec![0u16; 105]),
        ]),
        shutdown: Some(shutdown_tx),
    };
    let sink = RecordingSink::default();

    let scheduler = PollingScheduler::new(
        bus,
        meter_bindings(1),
        sink.clone(),
        test_config(),
        shutdown_rx,
    );
    scheduler.run().await;

    let log = log.lock().unwrap();
    assert_eq!(log.reads[0], (40_000, 70));
    assert_eq!(log.reads[1], (40_121, 65));
    assert_eq!(log.reads[2], (40_069, 40));
    assert_eq!(log.reads[3], (40_188, 105));

    let names = sink.names();
    assert!(names.iter().any(|name| name == "ac_power_watts"));
    assert!(names.iter().any(|name| name == "ac_lifetime_energy_wh"));
    assert!(!names.iter().any(|name| name.starts_with("meter1_")));
}

#[tokio::test(start_paused = true)]
async fn second_meter_reads_the_strided_register_ranges() {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let log = Arc::new(Mutex::new(BusLog::default()));
    let bus = ScriptedBus {
        log: Arc::clone(&log),
        connect_failures: 0,
        reads: VecDeque::from(vec![
            Ok(inverter_common_regs()),
            Ok(meter_common_regs()),
            Ok(meter_common_regs()),
            Ok(inverter_telemetry_regs()),
            Ok(meter_telemetry_regs()),
            Ok(meter_telemetry_regs()),
        ]),
        shutdown: Some(shutdown_tx),
    };
    let sink = RecordingSink::default();

    let scheduler = PollingScheduler::new(
        bus,
        meter_bindings(2),
        sink.clone(),
        test_config(),
        shutdown_rx,
    );
    scheduler.run().await;

    let log = log.lock().unwrap();
    assert!(log.reads.contains(&(40_295, 65)));
    assert!(log.reads.contains(&(40_362, 105)));

    let names = sink.names();
    assert!(names.iter().any(|name| name == "meter1_ac_power_watts"));
    assert!(names.iter().any(|name| name == "meter2_imported_wh_phase_a"));
    assert!(names.iter().any(|name| name == "meter2_exported_wh"));
}

#[tokio::test(start_paused = true)]
async fn shutdown_interrupts_the_retry_sleep() {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let log = Arc::new(Mutex::new(BusLog::default()));
    let bus = ScriptedBus {
        log: Arc::clone(&log),
        connect_failures: 100,
        reads: VecDeque::new(),
        shutdown: None,
    };
    let sink = RecordingSink::default();

    let scheduler =
        PollingScheduler::new(bus, Vec::new(), sink, test_config(), shutdown_rx);
    let started = Instant::now();
    let handle = tokio::spawn(scheduler.run());

    tokio::time::sleep(Duration::from_secs(1)).await;
    shutdown_tx.send(true).expect("send shutdown");
    handle.await.expect("scheduler task");

    // The 7s retry window is cut short by the signal.
    assert!(started.elapsed() < Duration::from_secs(7));
    assert_eq!(log.lock().unwrap().connects, 1);
}

fn inverter_common_regs() -> Vec<u16> {
    let mut regs = vec![0u16; 70];
    regs[0] = 0x5375;
    regs[1] = 0x6e53;
    regs[2] = 1;
    regs[3] = 65;
    regs
}

fn meter_common_regs() -> Vec<u16> {
    let mut regs = vec![0u16; 65];
    regs[0] = 1;
    regs[1] = 65;
    regs
}

fn inverter_telemetry_regs() -> Vec<u16> {
    let mut regs = vec![0u16; 40];
    regs[0] = 101;
    regs[1] = 50;
    regs[14] = 1_500;
    regs[38] = 4;
    regs
}

fn meter_telemetry_regs() -> Vec<u16> {
    let mut regs = vec![0u16; 105];
    regs[0] = 203;
    regs[1] = 105;
    regs[18] = 2_000;
    regs[48] = 0;
    regs[49] = 9_000;
    regs[54] = 1;
    regs
}
