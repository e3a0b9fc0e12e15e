use std::env::var;
use std::time::Duration;

/// Sets a configuration field based on an environment variable.
macro_rules! set_from_env {
    ($config:expr, $field:ident, $key:expr, $value_type:ty) => {{
        if let Ok(raw_value) = var(concat!("HORIZON_", $key)) {
            if let Ok(value) = raw_value.parse::<$value_type>() {
                if value > 0 {
                    $config.$field = value;
                }
            }
        };
    }};
}

/// The widest affinity mask we support, and thus the largest number of
/// virtual cores.
pub const MAX_CORES: u8 = 64;

/// The core ID given to a thread while it sits on the parked queue.
///
/// This is a sentinel and never a valid index into the core table.
pub const PARKED_CORE_ID: u8 = 0xFF;

/// The default number of virtual cores to emulate.
const DEFAULT_CORES: u8 = 4;

/// The default duration (in milliseconds) a thread in a core's preemption
/// band may run before its preemption timer fires.
const DEFAULT_TIMESLICE: u64 = 10;

/// The priority band at which each core arms timer-driven preemption.
///
/// The guest kernel preempts at band 59 on the application cores and band 63
/// on the system core.
const DEFAULT_PREEMPTION_PRIORITIES: [i8; 4] = [59, 59, 59, 63];

/// Structure containing the configuration settings of the scheduler.
pub struct Config {
    /// The number of virtual cores to schedule threads onto.
    pub cores: u8,

    /// The timeslice granted to threads running in a core's preemption band.
    pub preemptive_timeslice: Duration,

    /// Per-core preemption priority bands, indexed by core ID.
    pub preemption_priorities: Vec<i8>,
}

impl Config {
    pub fn new() -> Config {
        Config {
            cores: DEFAULT_CORES,
            preemptive_timeslice: Duration::from_millis(DEFAULT_TIMESLICE),
            preemption_priorities: DEFAULT_PREEMPTION_PRIORITIES.to_vec(),
        }
    }

    pub fn from_env() -> Config {
        let mut config = Config::new();

        set_from_env!(config, cores, "CORES", u8);

        if let Ok(raw_value) = var("HORIZON_TIMESLICE_MS") {
            if let Ok(value) = raw_value.parse::<u64>() {
                if value > 0 {
                    config.preemptive_timeslice = Duration::from_millis(value);
                }
            }
        }

        config.verify();
        config
    }

    fn verify(&mut self) {
        if self.cores > MAX_CORES {
            self.cores = MAX_CORES;
        }

        // The priority table must cover every core. Extra cores inherit the
        // band of the last configured core.
        let last = self.preemption_priorities.last().copied().unwrap_or(59);

        self.preemption_priorities.resize(self.cores as usize, last);
    }
}
