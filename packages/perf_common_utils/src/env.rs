use std::{env, str::FromStr};

/// Reads and parses the env. variable.
///
/// - `None` when the variable is not defined.
/// - `None` with a warning when the value cannot be parsed into `T`.
pub fn env_var_parse<T: FromStr>(name: &str) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    let value = env::var(name).ok()?;
    match value.trim().parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            log::warn!("Ignoring env. variable {name}={value}. Unable to parse it: {e}");
            None
        }
    }
}

/// Read env. variable with a fallback.
///
/// ```ignore
/// let threads = env_var_with_defaults!("PERF_PRODUCER_THREADS", usize, 16);
/// let rate = env_var_with_defaults!("PERF_TARGET_RATE", Option::<f64>);
/// let rate_or_default = env_var_with_defaults!("PERF_TARGET_RATE", Option::<f64>, 100.0);
/// ```
#[macro_export]
macro_rules! env_var_with_defaults {
    ($name: expr, Option::<$type: ty>) => {
        $crate::env::env_var_parse::<$type>($name)
    };
    ($name: expr, Option::<$type: ty>, $default: expr) => {
        $crate::env::env_var_parse::<$type>($name).or(Some($default))
    };
    ($name: expr, $type: ty, $default: expr) => {
        $crate::env::env_var_parse::<$type>($name).unwrap_or($default)
    };
}
