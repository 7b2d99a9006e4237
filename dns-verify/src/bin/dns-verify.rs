// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command-line tool that asks a DNS provider to publish its records and
//! checks that names resolve to the addresses the orchestrator assigned

use anyhow::{bail, Context, Result};
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use dns_verify::config::Config;
use dns_verify::logging::{init_logger, LogLevel};
use dns_verify::{
    cancel_pair, verify_all_checks, DnsResolver, ExpectedBinding, RecordCheck,
    Trigger, VerificationResult,
};
use slog::{info, warn, Logger};
use std::net::IpAddr;
use std::time::Duration;

#[derive(Debug, Parser)]
#[clap(
    name = "dns-verify",
    about = "Verify that a DNS provider publishes the expected records"
)]
struct Opt {
    /// TOML configuration file
    #[clap(long, action)]
    config_file: Utf8PathBuf,

    /// Override the configured log level
    #[clap(long, action)]
    log_level: Option<LogLevel>,

    #[clap(subcommand)]
    subcommand: SubCommand,
}

#[derive(Debug, Subcommand)]
enum SubCommand {
    /// Ask the provider to export and reload its zones, once
    Trigger,
    /// Check that a name resolves to an address
    Verify(VerifyArgs),
    /// Trigger an export, then verify
    Check(VerifyArgs),
    /// Verify several bindings concurrently
    VerifyMany(VerifyManyArgs),
}

#[derive(Debug, Args)]
struct VerifyArgs {
    /// Fully qualified DNS name to look up
    #[clap(long, action)]
    name: String,

    /// Address the name must resolve to
    #[clap(long, action)]
    address: IpAddr,

    #[clap(flatten)]
    output: OutputArgs,
}

#[derive(Debug, Args)]
struct VerifyManyArgs {
    /// NAME=ADDRESS pairs to verify
    #[clap(
        long = "binding",
        action,
        required = true,
        value_parser = parse_binding
    )]
    bindings: Vec<ExpectedBinding>,

    /// Maximum number of bindings verified at once
    #[clap(long, action, default_value_t = 4)]
    concurrency: usize,

    #[clap(flatten)]
    output: OutputArgs,
}

#[derive(Debug, Args)]
struct OutputArgs {
    /// Give up on verification after this many seconds
    #[clap(long, action)]
    deadline_secs: Option<u64>,

    /// Also check that each address resolves back to its name (PTR)
    #[clap(long, action)]
    reverse: bool,

    /// Print results as JSON
    #[clap(long, action)]
    json: bool,
}

impl OutputArgs {
    fn checks(&self) -> &'static [RecordCheck] {
        if self.reverse {
            &[RecordCheck::Forward, RecordCheck::Reverse]
        } else {
            &[RecordCheck::Forward]
        }
    }
}

fn parse_binding(s: &str) -> Result<ExpectedBinding, String> {
    let (name, address) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=ADDRESS, found {:?}", s))?;
    let address: IpAddr = address
        .parse()
        .map_err(|e| format!("invalid address {:?}: {}", address, e))?;
    ExpectedBinding::new(name, address).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();
    let mut config = Config::from_file(&opt.config_file)
        .with_context(|| format!("loading {}", opt.config_file))?;
    if let Some(level) = opt.log_level {
        config.log.level = level;
    }
    let log = init_logger(&config.log, "dns-verify");

    match &opt.subcommand {
        SubCommand::Trigger => trigger(&log, &config).await,
        SubCommand::Verify(args) => {
            let binding = ExpectedBinding::new(&args.name, args.address)?;
            let results =
                verify_bindings(&log, &config, &[binding], 1, &args.output)
                    .await;
            report(&results, &args.output)
        }
        SubCommand::Check(args) => {
            let binding = ExpectedBinding::new(&args.name, args.address)?;
            trigger(&log, &config).await?;
            let results =
                verify_bindings(&log, &config, &[binding], 1, &args.output)
                    .await;
            report(&results, &args.output)
        }
        SubCommand::VerifyMany(args) => {
            let results = verify_bindings(
                &log,
                &config,
                &args.bindings,
                args.concurrency,
                &args.output,
            )
            .await;
            report(&results, &args.output)
        }
    }
}

async fn trigger(log: &Logger, config: &Config) -> Result<()> {
    let request = config.dns_api.to_request()?;
    let trigger = Trigger::new(log.clone(), config.dns_api.request_timeout)
        .context("building HTTP client")?;
    trigger.trigger(&request).await?;
    Ok(())
}

async fn verify_bindings(
    log: &Logger,
    config: &Config,
    bindings: &[ExpectedBinding],
    concurrency: usize,
    output: &OutputArgs,
) -> Vec<VerificationResult> {
    let resolver = DnsResolver::new(log.clone(), &config.resolver);

    let (canceller, mut signal) = cancel_pair();
    if let Some(secs) = output.deadline_secs {
        signal = signal.with_timeout(Duration::from_secs(secs));
    }
    let interrupt_log = log.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(interrupt_log, "interrupted; cancelling verification");
            canceller.cancel();
        }
    });

    info!(log, "verifying";
        "bindings" => bindings.len(),
        "reverse" => output.reverse,
    );
    verify_all_checks(
        log,
        &resolver,
        bindings,
        output.checks(),
        &config.resolver,
        concurrency,
        signal,
    )
    .await
}

fn report(results: &[VerificationResult], output: &OutputArgs) -> Result<()> {
    if output.json {
        println!("{}", serde_json::to_string_pretty(results)?);
    } else {
        for result in results {
            println!("{}", result);
        }
    }

    let failed = results.iter().filter(|r| !r.success).count();
    if failed > 0 {
        bail!(
            "{} of {} check(s) failed verification",
            failed,
            results.len()
        );
    }
    Ok(())
}
