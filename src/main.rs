//! CLI entry for the auto-enrollment agent.
//!
//! Exit codes: 0 ok, 1 strict-warn, 2 config/preflight error,
//! 3 sanitation leak.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::{error, info, warn};

use autoelective::config::{self, Config};
use autoelective::engine::Context;
use autoelective::fixtures;
use autoelective::preflight::{self, IssueLevel};
use autoelective::rehearsal::{RehearsalOptions, run_rehearsal};

#[derive(Parser)]
#[command(name = "autoelective", version, about = "Supplementary course-election agent")]
struct Cli {
    /// Path to the INI configuration file.
    #[arg(short, long, global = true, default_value = "config.ini", env = "AUTOELECTIVE_CONFIG_INI")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the enrollment loops (the default).
    Run {
        /// Also run the read-only monitor endpoint.
        #[arg(short = 'm', long)]
        with_monitor: bool,
    },
    /// Validate the configuration without any network traffic.
    Preflight {
        /// Treat warnings as failures (exit code 1).
        #[arg(long)]
        strict: bool,
    },
    /// Log in and fetch everything read-only; never elects.
    Rehearsal {
        #[arg(long)]
        strict: bool,
        /// Also fetch a captcha image and run a dummy validate.
        #[arg(long)]
        with_captcha: bool,
        #[arg(long, default_value = "runtime/rehearsal")]
        cache_dir: PathBuf,
    },
    /// Sanitize captured fixtures in a directory and verify no leaks.
    PromoteFixtures {
        dir: PathBuf,
    },
    /// Bounded-round run against the live site for stability testing.
    Soak {
        #[arg(long, default_value_t = 50)]
        rounds: u64,
    },
    /// Scan a directory of fixtures for residual secrets.
    Audit {
        dir: PathBuf,
    },
}

fn load_config(path: &PathBuf) -> Result<Config, ExitCode> {
    match config::from_ini_path(path) {
        Ok(cfg) => Ok(cfg),
        Err(e) => {
            error!("config error: {e}");
            Err(ExitCode::from(2))
        }
    }
}

fn preflight_gate(cfg: &Config, strict: bool, verbose: bool) -> Option<ExitCode> {
    let issues = preflight::run_preflight(cfg);
    for issue in &issues {
        let line = match issue.key_path {
            Some(key) => format!("[{}] {} ({key}): {}", issue.level, issue.code, issue.message),
            None => format!("[{}] {}: {}", issue.level, issue.code, issue.message),
        };
        match issue.level {
            IssueLevel::Error => error!("{line}"),
            IssueLevel::Warn => warn!("{line}"),
        }
    }
    if preflight::has_errors(&issues) {
        return Some(ExitCode::from(2));
    }
    if strict && !issues.is_empty() {
        return Some(ExitCode::from(1));
    }
    if verbose && issues.is_empty() {
        info!("preflight: no issues");
    }
    None
}

async fn cmd_run(cfg: Config, with_monitor: bool) -> ExitCode {
    if let Some(code) = preflight_gate(&cfg, false, false) {
        return code;
    }
    if with_monitor {
        warn!("monitor requested but not configured in this build; continuing without it");
    }
    let ctx = match Context::new(cfg) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("startup failed: {e}");
            return ExitCode::from(2);
        }
    };
    match autoelective::run_agent(ctx).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("agent failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn sanitize_dir(dir: &PathBuf, student_id: &str, write: bool) -> Result<usize, ExitCode> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        error!("cannot read {}: {e}", dir.display());
        ExitCode::from(2)
    })?;
    let id = (!student_id.is_empty()).then_some(student_id);
    let mut leaks = 0usize;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Ok(raw) = std::fs::read(&path) else { continue };
        let clean = fixtures::sanitize_bytes(&raw, None, id);
        if write && clean != raw {
            if let Err(e) = std::fs::write(&path, &clean) {
                error!("cannot rewrite {}: {e}", path.display());
                return Err(ExitCode::from(2));
            }
            info!("sanitized {}", path.display());
        }
        let text = String::from_utf8_lossy(&clean);
        let findings = fixtures::scan_for_leaks(&text, id);
        for finding in &findings {
            error!("leak in {}: {finding}", path.display());
        }
        leaks += findings.len();
    }
    Ok(leaks)
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let cfg = match load_config(&cli.config) {
        Ok(cfg) => cfg,
        Err(code) => return code,
    };

    match cli.command.unwrap_or(Command::Run { with_monitor: false }) {
        Command::Run { with_monitor } => cmd_run(cfg, with_monitor).await,
        Command::Preflight { strict } => {
            preflight_gate(&cfg, strict, true).unwrap_or(ExitCode::SUCCESS)
        }
        Command::Rehearsal {
            strict,
            with_captcha,
            cache_dir,
        } => {
            if let Some(code) = preflight_gate(&cfg, false, false) {
                return code;
            }
            let opts = RehearsalOptions {
                strict,
                with_captcha,
                cache_dir,
            };
            match run_rehearsal(&cfg, &opts).await {
                Ok(summary) => {
                    match serde_json::to_string_pretty(&summary) {
                        Ok(body) => println!("{body}"),
                        Err(e) => warn!("summary render failed: {e}"),
                    }
                    if !summary.ok || (strict && !summary.strict_ok) {
                        ExitCode::FAILURE
                    } else {
                        ExitCode::SUCCESS
                    }
                }
                Err(e) => {
                    error!("rehearsal failed: {e:#}");
                    ExitCode::FAILURE
                }
            }
        }
        Command::PromoteFixtures { dir } => {
            match sanitize_dir(&dir, &cfg.user.student_id, true) {
                Ok(0) => ExitCode::SUCCESS,
                Ok(_) => ExitCode::from(3),
                Err(code) => code,
            }
        }
        Command::Soak { rounds } => {
            let mut cfg = cfg;
            cfg.runtime.max_rounds = Some(rounds);
            cmd_run(cfg, false).await
        }
        Command::Audit { dir } => match sanitize_dir(&dir, &cfg.user.student_id, false) {
            Ok(0) => ExitCode::SUCCESS,
            Ok(_) => ExitCode::from(3),
            Err(code) => code,
        },
    }
}
