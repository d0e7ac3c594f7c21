use std::fs;
use std::path::PathBuf;

use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_NOISE_FILTER: &str = "player_stdout=error,player_stderr=error,docker_cli=error";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_LOG_FILE_PREFIX: &str = "bagcockpit";
pub const DEFAULT_LOG_FILE_SUFFIX: &str = "log";

/// Tracing targets that carry raw output from external processes. They are
/// quieted on the console by the noise filter but kept at debug in the log
/// file so abnormal-exit diagnostics stay recoverable.
const EXTERNAL_OUTPUT_TARGETS: [&str; 3] = ["player_stdout", "player_stderr", "docker_cli"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeLogMode {
    Cli,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingInitOptions {
    pub mode: RuntimeLogMode,
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub default_log_filter: String,
    pub noise_filter: String,
    pub retention_files: usize,
}

impl Default for LoggingInitOptions {
    fn default() -> Self {
        Self {
            mode: RuntimeLogMode::Server,
            data_dir: None,
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            default_log_filter: DEFAULT_LOG_FILTER.to_string(),
            noise_filter: DEFAULT_NOISE_FILTER.to_string(),
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingFilterPlan {
    pub user_filter: String,
    pub console_filter: String,
    pub file_filter: String,
}

#[derive(Debug)]
pub struct LoggingInitPlan {
    pub filters: LoggingFilterPlan,
    pub file_sink: FileSinkPlan,
}

#[derive(Debug)]
pub enum FileSinkPlan {
    Ready(ReadyFileSinkPlan),
    Fallback(FallbackFileSinkPlan),
}

#[derive(Debug)]
pub struct ReadyFileSinkPlan {
    pub log_dir: PathBuf,
    pub appender: RollingFileAppender,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackFileSinkPlan {
    pub attempted_log_dir: Option<PathBuf>,
    pub reason: String,
}

impl FileSinkPlan {
    pub fn is_ready(&self) -> bool {
        matches!(self, FileSinkPlan::Ready(_))
    }

    pub fn log_dir(&self) -> Option<&PathBuf> {
        match self {
            FileSinkPlan::Ready(ready) => Some(&ready.log_dir),
            FileSinkPlan::Fallback(fallback) => fallback.attempted_log_dir.as_ref(),
        }
    }
}

pub fn compose_logging_init_plan(options: &LoggingInitOptions) -> LoggingInitPlan {
    LoggingInitPlan {
        filters: compose_logging_filters(options),
        file_sink: build_file_sink_plan(options),
    }
}

pub fn build_file_sink_plan(options: &LoggingInitOptions) -> FileSinkPlan {
    let retention_files = normalize_retention_files(options.retention_files);

    let Some(data_dir) = options.data_dir.as_deref() else {
        return FileSinkPlan::Fallback(FallbackFileSinkPlan {
            attempted_log_dir: None,
            reason: "file sink disabled: data_dir is not configured".to_string(),
        });
    };

    let log_dir = data_dir.join(DEFAULT_LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&log_dir) {
        return FileSinkPlan::Fallback(FallbackFileSinkPlan {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to create log directory: {error}"),
        });
    }

    let appender_builder = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(DEFAULT_LOG_FILE_PREFIX)
        .filename_suffix(DEFAULT_LOG_FILE_SUFFIX)
        .max_log_files(retention_files);

    match appender_builder.build(&log_dir) {
        Ok(appender) => FileSinkPlan::Ready(ReadyFileSinkPlan { log_dir, appender }),
        Err(error) => FileSinkPlan::Fallback(FallbackFileSinkPlan {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to initialize rolling file sink: {error}"),
        }),
    }
}

pub fn compose_logging_filters(options: &LoggingInitOptions) -> LoggingFilterPlan {
    let user_filter = select_user_filter(options);

    // Explicit filters and -v take the directives verbatim; only the
    // implicit default gets external-process noise suppression.
    let implicit = options.cli_log_filter.is_none() && options.verbose == 0;

    let console_filter = merge_noise_filter(&options.noise_filter, &user_filter, implicit);
    let file_filter = if implicit {
        let file_noise = keep_external_targets_at_debug(&options.noise_filter);
        merge_noise_filter(&file_noise, &user_filter, true)
    } else {
        user_filter.clone()
    };

    LoggingFilterPlan {
        user_filter,
        console_filter,
        file_filter,
    }
}

pub fn select_log_filter(options: &LoggingInitOptions) -> String {
    compose_logging_filters(options).console_filter
}

fn normalize_retention_files(retention_files: usize) -> usize {
    if retention_files == 0 {
        DEFAULT_LOG_RETENTION_FILES
    } else {
        retention_files
    }
}

fn select_user_filter(options: &LoggingInitOptions) -> String {
    if let Some(filter) = options.cli_log_filter.as_deref() {
        filter.to_string()
    } else if options.verbose >= 2 {
        "trace".to_string()
    } else if options.verbose == 1 {
        "debug".to_string()
    } else if let Some(filter) = options.rust_log_env.as_deref() {
        filter.to_string()
    } else {
        options.default_log_filter.clone()
    }
}

fn merge_noise_filter(noise_filter: &str, user_filter: &str, include_noise: bool) -> String {
    if include_noise && !noise_filter.trim().is_empty() {
        format!("{noise_filter},{user_filter}")
    } else {
        user_filter.to_string()
    }
}

/// Rewrite the console noise filter for the file sink: external-process
/// targets are raised to debug instead of silenced, every other directive
/// passes through unchanged.
fn keep_external_targets_at_debug(noise_filter: &str) -> String {
    let mut directives = Vec::new();
    let mut seen_external: Vec<&str> = Vec::new();

    for directive in noise_filter
        .split(',')
        .map(str::trim)
        .filter(|directive| !directive.is_empty())
    {
        if let Some((target, _)) = directive.split_once('=') {
            let target = target.trim();
            if EXTERNAL_OUTPUT_TARGETS.contains(&target) {
                if !seen_external.contains(&target) {
                    directives.push(format!("{target}=debug"));
                    seen_external.push(target);
                }
                continue;
            }
        }

        directives.push(directive.to_string());
    }

    for target in EXTERNAL_OUTPUT_TARGETS {
        if !seen_external.contains(&target) {
            directives.push(format!("{target}=debug"));
        }
    }

    directives.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options_with(
        verbose: u8,
        cli_log_filter: Option<&str>,
        rust_log_env: Option<&str>,
    ) -> LoggingInitOptions {
        LoggingInitOptions {
            verbose,
            cli_log_filter: cli_log_filter.map(ToString::to_string),
            rust_log_env: rust_log_env.map(ToString::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn default_filter_includes_noise_suppression() {
        let selected = select_log_filter(&options_with(0, None, None));
        assert_eq!(selected, format!("{DEFAULT_NOISE_FILTER},info"));
    }

    #[test]
    fn rust_log_env_used_when_no_cli_overrides() {
        let selected = select_log_filter(&options_with(0, None, Some("debug")));
        assert_eq!(selected, format!("{DEFAULT_NOISE_FILTER},debug"));
    }

    #[test]
    fn verbose_flag_overrides_rust_log() {
        let selected = select_log_filter(&options_with(1, None, Some("info")));
        assert_eq!(selected, "debug");
    }

    #[test]
    fn double_verbose_enables_trace() {
        let selected = select_log_filter(&options_with(2, None, Some("info")));
        assert_eq!(selected, "trace");
    }

    #[test]
    fn explicit_log_filter_has_highest_precedence() {
        let selected = select_log_filter(&options_with(2, Some("bagcockpit_core=trace"), Some("warn")));
        assert_eq!(selected, "bagcockpit_core=trace");
    }

    #[test]
    fn file_filter_keeps_external_targets_at_debug() {
        let plan = compose_logging_filters(&options_with(0, None, None));
        assert!(plan.file_filter.contains("player_stderr=debug"));
        assert!(plan.file_filter.contains("player_stdout=debug"));
        assert!(plan.file_filter.contains("docker_cli=debug"));
        assert!(plan.file_filter.ends_with(",info"));
    }

    #[test]
    fn explicit_filter_applies_to_file_sink_verbatim() {
        let plan = compose_logging_filters(&options_with(0, Some("trace"), None));
        assert_eq!(plan.file_filter, "trace");
        assert_eq!(plan.console_filter, "trace");
    }

    #[test]
    fn keep_external_targets_preserves_unrelated_directives() {
        let rewritten = keep_external_targets_at_debug("hyper=warn,player_stderr=error");
        assert!(rewritten.contains("hyper=warn"));
        assert!(rewritten.contains("player_stderr=debug"));
        assert!(!rewritten.contains("player_stderr=error"));
    }

    #[test]
    fn file_sink_plan_without_data_dir_falls_back() {
        let plan = build_file_sink_plan(&LoggingInitOptions::default());
        assert!(!plan.is_ready());
        assert!(plan.log_dir().is_none());
    }

    #[test]
    fn file_sink_plan_creates_log_dir() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let options = LoggingInitOptions {
            data_dir: Some(temp.path().to_path_buf()),
            ..Default::default()
        };

        let plan = build_file_sink_plan(&options);
        assert!(plan.is_ready());
        assert_eq!(plan.log_dir(), Some(&temp.path().join(DEFAULT_LOG_DIR_NAME)));
        assert!(temp.path().join(DEFAULT_LOG_DIR_NAME).is_dir());
    }

    #[test]
    fn zero_retention_is_normalized_to_default() {
        assert_eq!(normalize_retention_files(0), DEFAULT_LOG_RETENTION_FILES);
        assert_eq!(normalize_retention_files(7), 7);
    }
}
