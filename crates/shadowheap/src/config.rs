//! Runtime parameters, read once at setup from the options environment
//! variable. Tokens are space-separated `--key=value` pairs; bare `--key`
//! tokens set boolean flags.

use log::warn;

/// Environment variable holding the option string.
pub const OPTIONS_ENV_VAR: &str = "SHADOWHEAP_OPTIONS";

/// Default global quarantine cap, in bytes.
pub const DEFAULT_QUARANTINE_SIZE: usize = 16 * 1024 * 1024;

/// Default per-block quarantine cap: larger blocks bypass the quarantine.
pub const DEFAULT_QUARANTINE_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Default stack capture depth.
pub const DEFAULT_MAX_NUM_FRAMES: usize = 62;

/// Threshold above which allocations go to the large-block heap.
pub const DEFAULT_LARGE_ALLOCATION_THRESHOLD: usize = 16 * 1024;

#[derive(Clone, Debug)]
pub struct RuntimeParams {
    /// Global cap on quarantine bytes. 0 disables the quarantine.
    pub quarantine_size: usize,
    /// Blocks larger than this are released immediately on free.
    pub quarantine_block_size: usize,
    /// Stack capture depth.
    pub max_num_frames: usize,
    /// Frames to drop from the bottom of each capture (runtime frames).
    pub bottom_frames_to_skip: usize,
    /// Log a stack-cache statistics line every N saves. 0 disables it.
    pub reporting_period: usize,
    /// Probability in [0, 1] that a new allocation is wrapped in an envelope.
    pub allocation_guard_rate: f32,
    /// Allocations of at least this many bytes use the large-block heap.
    pub large_allocation_threshold: usize,
    /// Extra bytes appended to the minimum right redzone.
    pub trailer_padding_size: usize,
    /// Run the whole-heap corruption scan when a fault is filtered.
    pub check_heap_on_failure: bool,
    /// Create the zebra block heap at setup.
    pub enable_zebra_block_heap: bool,
    /// Respect the per-thread allocation-filter flag.
    pub enable_allocation_filter: bool,
    /// Never route allocations to the large-block heap.
    pub disable_large_block_heap: bool,
    /// Always use the default error handler, even if the host exposes a
    /// crash reporter.
    pub disable_breakpad_reporting: bool,
    /// Emit a minidump from the error callback.
    pub minidump_on_failure: bool,
    /// Terminate the process after reporting an error.
    pub exit_on_failure: bool,
    /// Render error reports as text through the logger.
    pub log_as_text: bool,
    /// Errors whose crash stack id is listed here are suppressed.
    pub ignored_stack_ids: Vec<u32>,
}

impl Default for RuntimeParams {
    fn default() -> Self {
        RuntimeParams {
            quarantine_size: DEFAULT_QUARANTINE_SIZE,
            quarantine_block_size: DEFAULT_QUARANTINE_BLOCK_SIZE,
            max_num_frames: DEFAULT_MAX_NUM_FRAMES,
            bottom_frames_to_skip: 0,
            reporting_period: 0,
            allocation_guard_rate: 1.0,
            large_allocation_threshold: DEFAULT_LARGE_ALLOCATION_THRESHOLD,
            trailer_padding_size: 0,
            check_heap_on_failure: true,
            enable_zebra_block_heap: false,
            enable_allocation_filter: false,
            disable_large_block_heap: false,
            disable_breakpad_reporting: false,
            minidump_on_failure: false,
            exit_on_failure: false,
            log_as_text: true,
            ignored_stack_ids: Vec::new(),
        }
    }
}

/// A malformed option token. Unknown keys only warn; a present key with an
/// unparseable value is an error so typos do not silently change behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionsError {
    pub token: String,
}

impl core::fmt::Display for OptionsError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "malformed option token '{}'", self.token)
    }
}

impl std::error::Error for OptionsError {}

/// Parse an option string into `params`.
pub fn parse_options(options: &str, params: &mut RuntimeParams) -> Result<(), OptionsError> {
    for token in options.split_whitespace() {
        let body = match token.strip_prefix("--") {
            Some(b) => b,
            None => return Err(OptionsError { token: token.into() }),
        };
        let (key, value) = match body.split_once('=') {
            Some((k, v)) => (k, Some(v)),
            None => (body, None),
        };
        apply_option(key, value, params).map_err(|_| OptionsError { token: token.into() })?;
    }
    Ok(())
}

/// Read the options environment variable, if set, into `params`.
pub fn read_from_env(params: &mut RuntimeParams) -> Result<(), OptionsError> {
    match std::env::var(OPTIONS_ENV_VAR) {
        Ok(options) => parse_options(&options, params),
        Err(_) => Ok(()),
    }
}

fn apply_option(key: &str, value: Option<&str>, params: &mut RuntimeParams) -> Result<(), ()> {
    match key {
        "quarantine_size" => params.quarantine_size = parse_usize(value)?,
        "quarantine_block_size" => params.quarantine_block_size = parse_usize(value)?,
        "max_num_frames" => params.max_num_frames = parse_usize(value)?,
        "bottom_frames_to_skip" => params.bottom_frames_to_skip = parse_usize(value)?,
        "reporting_period" => params.reporting_period = parse_usize(value)?,
        "allocation_guard_rate" => {
            let rate: f32 = value.ok_or(())?.parse().map_err(|_| ())?;
            if !(0.0..=1.0).contains(&rate) {
                return Err(());
            }
            params.allocation_guard_rate = rate;
        }
        "large_allocation_threshold" => params.large_allocation_threshold = parse_usize(value)?,
        "trailer_padding_size" => params.trailer_padding_size = parse_usize(value)?,
        "check_heap_on_failure" => params.check_heap_on_failure = parse_bool(value)?,
        "enable_zebra_block_heap" => params.enable_zebra_block_heap = parse_bool(value)?,
        "enable_allocation_filter" => params.enable_allocation_filter = parse_bool(value)?,
        "disable_large_block_heap" => params.disable_large_block_heap = parse_bool(value)?,
        "disable_breakpad_reporting" => params.disable_breakpad_reporting = parse_bool(value)?,
        "minidump_on_failure" => params.minidump_on_failure = parse_bool(value)?,
        "exit_on_failure" => params.exit_on_failure = parse_bool(value)?,
        "log_as_text" => params.log_as_text = parse_bool(value)?,
        "ignored_stack_ids" => {
            params.ignored_stack_ids = parse_stack_ids(value.ok_or(())?)?;
        }
        _ => {
            warn!("ignoring unknown option --{}", key);
        }
    }
    Ok(())
}

fn parse_usize(value: Option<&str>) -> Result<usize, ()> {
    value.ok_or(())?.parse().map_err(|_| ())
}

fn parse_bool(value: Option<&str>) -> Result<bool, ()> {
    match value {
        None => Ok(true), // bare flag
        Some("1") | Some("true") => Ok(true),
        Some("0") | Some("false") => Ok(false),
        Some(_) => Err(()),
    }
}

/// Stack ids are semicolon-separated hex values, e.g. `0xDEAD;0xBEEF`.
fn parse_stack_ids(value: &str) -> Result<Vec<u32>, ()> {
    let mut ids = Vec::new();
    for part in value.split(';').filter(|p| !p.is_empty()) {
        let digits = part.strip_prefix("0x").or_else(|| part.strip_prefix("0X"));
        let id = u32::from_str_radix(digits.unwrap_or(part), 16).map_err(|_| ())?;
        ids.push(id);
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let p = RuntimeParams::default();
        assert_eq!(p.quarantine_size, DEFAULT_QUARANTINE_SIZE);
        assert!(p.check_heap_on_failure);
        assert!(!p.enable_zebra_block_heap);
        assert_eq!(p.allocation_guard_rate, 1.0);
    }

    #[test]
    fn parses_mixed_tokens() {
        let mut p = RuntimeParams::default();
        parse_options(
            "--quarantine_size=1048576 --exit_on_failure \
             --allocation_guard_rate=0.5 --ignored_stack_ids=0xDEAD;0xBEEF",
            &mut p,
        )
        .unwrap();
        assert_eq!(p.quarantine_size, 1048576);
        assert!(p.exit_on_failure);
        assert_eq!(p.allocation_guard_rate, 0.5);
        assert_eq!(p.ignored_stack_ids, vec![0xDEAD, 0xBEEF]);
    }

    #[test]
    fn rejects_malformed_value() {
        let mut p = RuntimeParams::default();
        assert!(parse_options("--quarantine_size=ten", &mut p).is_err());
        assert!(parse_options("--allocation_guard_rate=1.5", &mut p).is_err());
        assert!(parse_options("quarantine_size=1", &mut p).is_err());
    }

    #[test]
    fn unknown_key_is_ignored() {
        let mut p = RuntimeParams::default();
        parse_options("--no_such_option=1", &mut p).unwrap();
    }
}
