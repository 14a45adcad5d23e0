use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use modbus_transport::{ModbusTransport, TransportError};
use sunspec_models::{
    decode_inverter, decode_inverter_common, decode_meter, decode_meter_common, registers,
    InverterBlock, MeterBinding, MeterBlock,
};

/// Receives decoded telemetry as named real-valued measurements. The sink
/// owns its own registry and lifecycle; the scheduler never touches a
/// metrics backend directly.
pub trait MetricsSink: Send {
    fn publish(&self, name: &str, value: f64);
}

/// The scheduler's view of the bus: connect, close, read a register range.
/// Implemented by [`ModbusTransport`] in production and by scripted fakes in
/// tests.
#[allow(async_fn_in_trait)]
pub trait RegisterSource: Send {
    async fn connect(&mut self) -> Result<(), TransportError>;
    async fn close(&mut self);
    async fn read(&mut self, start: u16, count: u16) -> Result<Vec<u16>, TransportError>;
}

impl RegisterSource for ModbusTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        ModbusTransport::connect(self).await
    }

    async fn close(&mut self) {
        ModbusTransport::close(self).await;
    }

    async fn read(&mut self, start: u16, count: u16) -> Result<Vec<u16>, TransportError> {
        self.read_registers(start, count).await
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Steady-state delay between poll cycles.
    pub poll_interval: Duration,
    /// Delay before reconnecting after a connect or read failure.
    pub retry_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            retry_delay: Duration::from_secs(7),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Disconnected,
    Connected,
    Polling,
}

/// Drives the polling loop: one sequential worker that owns the only handle
/// to the transport and the retry policy. Bus errors degrade to stale
/// metrics, never to a crash.
pub struct PollingScheduler<T, S> {
    transport: T,
    meters: Vec<MeterBinding>,
    sink: S,
    config: SchedulerConfig,
    shutdown: watch::Receiver<bool>,
    state: SchedulerState,
}

impl<T, S> PollingScheduler<T, S>
where
    T: RegisterSource,
    S: MetricsSink,
{
    pub fn new(
        transport: T,
        meters: Vec<MeterBinding>,
        sink: S,
        config: SchedulerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            transport,
            meters,
            sink,
            config,
            shutdown,
            state: SchedulerState::Disconnected,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Runs until the shutdown signal flips. All sleeps are interruptible,
    /// so shutdown does not wait out a retry window.
    pub async fn run(mut self) {
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            match self.state {
                SchedulerState::Disconnected => match self.transport.connect().await {
                    Ok(()) => {
                        info!("bus connected");
                        self.state = SchedulerState::Connected;
                        self.identify().await;
                    }
                    Err(err) => {
                        warn!(error = %err, retry_in = ?self.config.retry_delay, "bus connect failed");
                        if !self.wait(self.config.retry_delay).await {
                            break;
                        }
                    }
                },
                SchedulerState::Connected | SchedulerState::Polling => {
                    self.state = SchedulerState::Polling;
                    match self.poll_cycle().await {
                        Ok(()) => {
                            self.state = SchedulerState::Connected;
                            if !self.wait(self.config.poll_interval).await {
                                break;
                            }
                        }
                        Err(err) => {
                            warn!(error = %err, "bus read failed, reconnecting");
                            self.transport.close().await;
                            self.state = SchedulerState::Disconnected;
                            if !self.wait(self.config.retry_delay).await {
                                break;
                            }
                        }
                    }
                }
            }
        }

        self.transport.close().await;
        info!("polling stopped");
    }

    /// One-time identification reads after (re)connect. Informational only:
    /// a failure is logged and telemetry polling proceeds regardless.
    async fn identify(&mut self) {
        match self
            .transport
            .read(
                registers::INVERTER_COMMON_BASE,
                registers::INVERTER_COMMON_REGS,
            )
            .await
        {
            Ok(regs) => match decode_inverter_common(&regs) {
                Ok(common) => info!(
                    manufacturer = %common.manufacturer,
                    model = %common.model,
                    serial = %common.serial,
                    version = %common.version,
                    "inverter identified"
                ),
                Err(err) => warn!(error = %err, "inverter identification decode failed"),
            },
            Err(err) => warn!(error = %err, "inverter identification read failed"),
        }

        for meter in &self.meters {
            match self
                .transport
                .read(meter.common_base, registers::METER_COMMON_REGS)
                .await
            {
                Ok(regs) => match decode_meter_common(&regs) {
                    Ok(common) => info!(
                        meter = meter.index,
                        manufacturer = %common.manufacturer,
                        model = %common.model,
                        option = common.option.as_deref().unwrap_or(""),
                        serial = %common.serial,
                        "meter identified"
                    ),
                    Err(err) => {
                        warn!(meter = meter.index, error = %err, "meter identification decode failed")
                    }
                },
                Err(err) => {
                    warn!(meter = meter.index, error = %err, "meter identification read failed")
                }
            }
        }
    }

    /// One full cycle: read every configured telemetry range, then decode
    /// and publish. Reads complete up front so a mid-cycle connection loss
    /// never publishes a partial cycle; a decode failure skips only the
    /// affected device.
    async fn poll_cycle(&mut self) -> Result<(), TransportError> {
        let inverter_regs = self
            .transport
            .read(
                registers::INVERTER_TELEMETRY_BASE,
                registers::INVERTER_TELEMETRY_REGS,
            )
            .await?;

        let mut meter_regs = Vec::with_capacity(self.meters.len());
        for meter in &self.meters {
            let regs = self
                .transport
                .read(meter.telemetry_base, registers::METER_TELEMETRY_REGS)
                .await?;
            meter_regs.push(regs);
        }

        match decode_inverter(&inverter_regs) {
            Ok(block) => {
                debug!(
                    raw_power = ?block.ac_power.raw,
                    ac_power = block.ac_power.value(),
                    state = ?block.operating_state(),
                    "inverter sample"
                );
                self.publish_inverter(&block);
            }
            Err(err) => warn!(error = %err, "inverter decode failed, sample skipped"),
        }

        for (meter, regs) in self.meters.iter().zip(&meter_regs) {
            match decode_meter(regs) {
                Ok(block) => {
                    debug!(
                        meter = meter.index,
                        ac_power = block.ac_power.value(),
                        exported_wh = block.exported_energy.value(),
                        imported_wh = block.imported_energy.value(),
                        "meter sample"
                    );
                    publish_meter(&self.sink, meter.index, &block);
                }
                Err(err) => {
                    warn!(meter = meter.index, error = %err, "meter decode failed, sample skipped")
                }
            }
        }

        Ok(())
    }

    fn publish_inverter(&self, block: &InverterBlock) {
        let sink = &self.sink;
        sink.publish("sunspec_did", f64::from(block.did));
        sink.publish("sunspec_length", f64::from(block.length));
        sink.publish("ac_current_amps", block.ac_current.value());
        sink.publish("ac_current_amps_phase_a", block.ac_current_a.value());
        sink.publish("ac_current_amps_phase_b", block.ac_current_b.value());
        sink.publish("ac_current_amps_phase_c", block.ac_current_c.value());
        sink.publish("ac_voltage_volts_ab", block.ac_voltage_ab.value());
        sink.publish("ac_voltage_volts_bc", block.ac_voltage_bc.value());
        sink.publish("ac_voltage_volts_ca", block.ac_voltage_ca.value());
        sink.publish("ac_voltage_volts_an", block.ac_voltage_an.value());
        sink.publish("ac_voltage_volts_bn", block.ac_voltage_bn.value());
        sink.publish("ac_voltage_volts_cn", block.ac_voltage_cn.value());
        sink.publish("ac_power_watts", block.ac_power.value());
        sink.publish("ac_frequency_hertz", block.ac_frequency.value());
        sink.publish("ac_apparent_power_va", block.ac_apparent_power.value());
        sink.publish("ac_reactive_power_var", block.ac_reactive_power.value());
        sink.publish("ac_power_factor_percent", block.ac_power_factor.value());
        sink.publish("ac_lifetime_energy_wh", block.ac_lifetime_energy.value());
        sink.publish("dc_current_amps", block.dc_current.value());
        sink.publish("dc_voltage_volts", block.dc_voltage.value());
        sink.publish("dc_power_watts", block.dc_power.value());
        sink.publish(
            "heatsink_temperature_celsius",
            block.heatsink_temperature.value(),
        );
        sink.publish("operating_state", f64::from(block.status));
        sink.publish("vendor_status", f64::from(block.vendor_status));
    }

    async fn wait(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = sleep(delay) => true,
            _ = self.shutdown.changed() => !*self.shutdown.borrow(),
        }
    }
}

fn publish_meter<S: MetricsSink>(sink: &S, index: u8, block: &MeterBlock) {
    let emit = |name: &str, value: f64| sink.publish(&format!("meter{index}_{name}"), value);

    emit("sunspec_did", f64::from(block.did));
    emit("sunspec_length", f64::from(block.length));
    emit("ac_current_amps", block.ac_current.value());
    emit("ac_current_amps_phase_a", block.ac_current_a.value());
    emit("ac_current_amps_phase_b", block.ac_current_b.value());
    emit("ac_current_amps_phase_c", block.ac_current_c.value());
    emit("ac_voltage_volts_ln", block.ac_voltage_ln.value());
    emit("ac_voltage_volts_an", block.ac_voltage_an.value());
    emit("ac_voltage_volts_bn", block.ac_voltage_bn.value());
    emit("ac_voltage_volts_cn", block.ac_voltage_cn.value());
    emit("ac_voltage_volts_ll", block.ac_voltage_ll.value());
    emit("ac_voltage_volts_ab", block.ac_voltage_ab.value());
    emit("ac_voltage_volts_bc", block.ac_voltage_bc.value());
    emit("ac_voltage_volts_ca", block.ac_voltage_ca.value());
    emit("ac_frequency_hertz", block.ac_frequency.value());
    emit("ac_power_watts", block.ac_power.value());
    emit("ac_power_watts_phase_a", block.ac_power_a.value());
    emit("ac_power_watts_phase_b", block.ac_power_b.value());
    emit("ac_power_watts_phase_c", block.ac_power_c.value());
    emit("ac_apparent_power_va", block.ac_apparent_power.value());
    emit("ac_apparent_power_va_phase_a", block.ac_apparent_power_a.value());
    emit("ac_apparent_power_va_phase_b", block.ac_apparent_power_b.value());
    emit("ac_apparent_power_va_phase_c", block.ac_apparent_power_c.value());
    emit("ac_reactive_power_var", block.ac_reactive_power.value());
    emit("ac_reactive_power_var_phase_a", block.ac_reactive_power_a.value());
    emit("ac_reactive_power_var_phase_b", block.ac_reactive_power_b.value());
    emit("ac_reactive_power_var_phase_c", block.ac_reactive_power_c.value());
    emit("ac_power_factor_percent", block.ac_power_factor.value());
    emit("ac_power_factor_percent_phase_a", block.ac_power_factor_a.value());
    emit("ac_power_factor_percent_phase_b", block.ac_power_factor_b.value());
    emit("ac_power_factor_percent_phase_c", block.ac_power_factor_c.value());
    emit("exported_wh", block.exported_energy.value());
    emit("exported_wh_phase_a", block.exported_energy_a.value());
    emit("exported_wh_phase_b", block.exported_energy_b.value());
    emit("exported_wh_phase_c", block.exported_energy_c.value());
    emit("imported_wh", block.imported_energy.value());
    emit("imported_wh_phase_a", block.imported_energy_a.value());
    emit("imported_wh_phase_b", block.imported_energy_b.value());
    emit("imported_wh_phase_c", block.imported_energy_c.value());
}
