//! Quicksilver JIT Agent
//!
//! The out-of-process compilation agent: reads framed work items from stdin,
//! compiles them with the same backend the in-process worker uses, and
//! writes framed replies to stdout. Started and supervised by the engine's
//! transport; exits when the request stream closes.

use clap::Parser;
use quicksilver_jit::{serve_agent, Arch};
use std::io::{stdin, stdout};

#[derive(Parser)]
#[command(name = "qjit-agent")]
#[command(author, version, about = "Quicksilver JIT compilation agent", long_about = None)]
struct Cli {
    /// Connection identifier assigned by the engine, echoed in logs
    #[arg(long)]
    connection_id: u64,

    /// Target architecture
    #[arg(long, default_value_t = Arch::Arm64)]
    arch: Arch,

    /// Emit every fixed-field guard even when records are linked
    #[arg(long)]
    conservative_guards: bool,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(
        connection_id = cli.connection_id,
        arch = %cli.arch,
        "agent ready"
    );

    serve_agent(
        &mut stdin().lock(),
        &mut stdout().lock(),
        cli.conservative_guards,
    )?;

    tracing::info!(connection_id = cli.connection_id, "request stream closed, exiting");
    Ok(())
}
