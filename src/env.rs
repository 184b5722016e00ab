//! Process environment tweaks applied before any model is touched

use tracing::{debug, info};

/// Upper bound on CPU worker threads handed to the tensor backend
const MAX_CPU_THREADS: usize = 4;

/// An environment variable as it stands after [`apply_compatibility_settings`]
#[derive(Debug, Clone, PartialEq)]
pub struct EnvSetting {
    pub key: &'static str,
    pub value: String,
    /// False when the user had already set the variable
    pub applied: bool,
}

/// Half the cores, at least one, at most [`MAX_CPU_THREADS`]
pub fn cpu_thread_budget(cpu_count: usize) -> usize {
    (cpu_count / 2).clamp(1, MAX_CPU_THREADS)
}

/// Set `key` unless the user already set it
pub fn set_default_var(key: &'static str, value: &str) -> EnvSetting {
    match std::env::var(key) {
        Ok(existing) => {
            debug!(key, value = %existing, "Keeping user-provided environment variable");
            EnvSetting {
                key,
                value: existing,
                applied: false,
            }
        }
        Err(_) => {
            std::env::set_var(key, value);
            EnvSetting {
                key,
                value: value.to_string(),
                applied: true,
            }
        }
    }
}

/// Apply the environment the pipeline expects.
///
/// - `CUDA_MODULE_LOADING=LAZY` so kernels are loaded on first use
/// - `RAYON_NUM_THREADS` sized by [`cpu_thread_budget`] for CPU kernels
///
/// Must run before the first tensor operation since the thread pool reads
/// the variable once.
pub fn apply_compatibility_settings() -> Vec<EnvSetting> {
    let threads = cpu_thread_budget(num_cpus::get());
    let settings = vec![
        set_default_var("CUDA_MODULE_LOADING", "LAZY"),
        set_default_var("RAYON_NUM_THREADS", &threads.to_string()),
    ];

    for setting in &settings {
        info!(
            key = setting.key,
            value = %setting.value,
            applied = setting.applied,
            "Environment"
        );
    }

    settings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_thread_budget() {
        assert_eq!(cpu_thread_budget(0), 1);
        assert_eq!(cpu_thread_budget(1), 1);
        assert_eq!(cpu_thread_budget(4), 2);
        assert_eq!(cpu_thread_budget(7), 3);
        assert_eq!(cpu_thread_budget(64), 4);
    }

    #[test]
    fn test_set_default_var_respects_existing() {
        let key = "FLUX_GEN_TEST_EXISTING_VAR";
        std::env::set_var(key, "user");
        let setting = set_default_var(key, "default");
        assert!(!setting.applied);
        assert_eq!(setting.value, "user");
        assert_eq!(std::env::var(key).unwrap(), "user");
    }

    #[test]
    fn test_set_default_var_sets_missing() {
        let key = "FLUX_GEN_TEST_MISSING_VAR";
        std::env::remove_var(key);
        let setting = set_default_var(key, "default");
        assert!(setting.applied);
        assert_eq!(std::env::var(key).unwrap(), "default");
    }
}
