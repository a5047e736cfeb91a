//! Sample telemetry for the agent binary.
//!
//! Produces sensor readings as [`Metric`]s and the occasional [`LogEntry`]
//! describing them, with log levels weighted towards `info`.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::model::{LogEntry, LogLevel, Metric};

/// Simulated sensor families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorType {
    Temperature,
    Humidity,
    Pressure,
    Vibration,
    Power,
}

impl SensorType {
    pub fn all() -> &'static [SensorType] {
        &[
            SensorType::Temperature,
            SensorType::Humidity,
            SensorType::Pressure,
            SensorType::Vibration,
            SensorType::Power,
        ]
    }

    /// Metric name, e.g. `sensor.temperature`.
    pub fn metric_name(&self) -> &'static str {
        match self {
            SensorType::Temperature => "sensor.temperature",
            SensorType::Humidity => "sensor.humidity",
            SensorType::Pressure => "sensor.pressure",
            SensorType::Vibration => "sensor.vibration",
            SensorType::Power => "sensor.power",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            SensorType::Temperature => "celsius",
            SensorType::Humidity => "percent",
            SensorType::Pressure => "hpa",
            SensorType::Vibration => "g",
            SensorType::Power => "watts",
        }
    }

    /// Normal operating range.
    fn nominal(&self) -> (f64, f64) {
        match self {
            SensorType::Temperature => (18.0, 28.0),
            SensorType::Humidity => (30.0, 60.0),
            SensorType::Pressure => (1000.0, 1025.0),
            SensorType::Vibration => (0.0, 0.5),
            SensorType::Power => (50.0, 400.0),
        }
    }

    /// Reading that trips a warning.
    fn alarm(&self) -> f64 {
        match self {
            SensorType::Temperature => 45.0,
            SensorType::Humidity => 90.0,
            SensorType::Pressure => 960.0,
            SensorType::Vibration => 3.0,
            SensorType::Power => 1200.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Simulated instances per sensor type
    pub sensors_per_type: usize,

    /// Probability that a reading is out of range
    pub anomaly_rate: f64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            sensors_per_type: 3,
            anomaly_rate: 0.05,
        }
    }
}

pub struct MetricGenerator {
    config: GeneratorConfig,
    device_id: String,
}

/// Log level mix for readings within range.
const LEVEL_WEIGHTS: [(LogLevel, u32); 6] = [
    (LogLevel::Trace, 5),
    (LogLevel::Debug, 15),
    (LogLevel::Info, 60),
    (LogLevel::Warn, 12),
    (LogLevel::Error, 7),
    (LogLevel::Fatal, 1),
];

impl MetricGenerator {
    pub fn new(device_id: impl Into<String>, config: GeneratorConfig) -> Self {
        Self {
            config: GeneratorConfig {
                sensors_per_type: config.sensors_per_type.max(1),
                anomaly_rate: config.anomaly_rate.clamp(0.0, 1.0),
            },
            device_id: device_id.into(),
        }
    }

    pub fn with_defaults(device_id: impl Into<String>) -> Self {
        Self::new(device_id, GeneratorConfig::default())
    }

    /// One reading from a random sensor.
    pub fn generate(&self) -> Metric {
        let mut rng = rand::thread_rng();
        let sensors = SensorType::all();
        let sensor = sensors[rng.gen_range(0..sensors.len())];
        self.reading(&mut rng, sensor)
    }

    /// One reading from every sensor instance.
    pub fn sweep(&self) -> Vec<Metric> {
        let mut rng = rand::thread_rng();
        SensorType::all()
            .iter()
            .flat_map(|&sensor| (1..=self.config.sensors_per_type).map(move |instance| (sensor, instance)))
            .map(|(sensor, instance)| self.reading_for(&mut rng, sensor, instance))
            .collect()
    }

    /// A log line about `metric`. Out-of-range readings always log at
    /// `warn` or above.
    pub fn describe(&self, metric: &Metric) -> LogEntry {
        let mut rng = rand::thread_rng();
        let source = metric
            .labels
            .get("sensor")
            .cloned()
            .unwrap_or_else(|| self.device_id.clone());

        let sensor = SensorType::all()
            .iter()
            .copied()
            .find(|s| s.metric_name() == metric.name);
        let anomalous = sensor.is_some_and(|s| is_anomalous(s, metric.value));

        let level = if anomalous {
            if rng.gen_bool(0.2) {
                LogLevel::Error
            } else {
                LogLevel::Warn
            }
        } else {
            LEVEL_WEIGHTS
                .choose_weighted(&mut rng, |(_, weight)| *weight)
                .map(|(level, _)| *level)
                .unwrap_or(LogLevel::Info)
        };

        let unit = sensor.map(|s| s.unit()).unwrap_or("");
        let message = match level {
            LogLevel::Warn | LogLevel::Error | LogLevel::Fatal if anomalous => {
                format!("{} out of range: {:.2} {}", metric.name, metric.value, unit)
            }
            LogLevel::Error | LogLevel::Fatal => format!("{} read failed, using last value", metric.name),
            _ => format!("{} reading {:.2} {}", metric.name, metric.value, unit),
        };

        LogEntry::new(source, level, message)
    }

    fn reading(&self, rng: &mut impl Rng, sensor: SensorType) -> Metric {
        let instance = rng.gen_range(1..=self.config.sensors_per_type);
        self.reading_for(rng, sensor, instance)
    }

    fn reading_for(&self, rng: &mut impl Rng, sensor: SensorType, instance: usize) -> Metric {
        let (low, high) = sensor.nominal();
        let alarm = sensor.alarm();
        let value = if !rng.gen_bool(self.config.anomaly_rate) {
            rng.gen_range(low..high)
        } else if alarm < low {
            alarm * rng.gen_range(0.9..1.0)
        } else {
            alarm * rng.gen_range(1.0..1.2)
        };

        Metric::new(sensor.metric_name(), value)
            .with_label("device", self.device_id.clone())
            .with_label("sensor", format!("{}-{:03}", sensor.metric_name().trim_start_matches("sensor."), instance))
            .with_label("unit", sensor.unit())
    }
}

fn is_anomalous(sensor: SensorType, value: f64) -> bool {
    let (low, _) = sensor.nominal();
    let alarm = sensor.alarm();
    if alarm < low {
        value <= alarm
    } else {
        value >= alarm
    }
}
