//! eeveon - 轻量 CI/CD 部署代理
//!
//! Usage:
//! - Agent mode: `eeveon`
//! - With custom port: `eeveon --port 9877`
//! - API-only (no polling): `eeveon --no-poll`
//! - One-shot: `eeveon check`, `eeveon deploy <rev>`, `eeveon status`

use std::process::ExitCode;

use eeveon::{AgentCommand, RuntimeConfig};

/// 解析命令行参数
fn parse_args() -> Result<RuntimeConfig, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = RuntimeConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" if i + 1 < args.len() => {
                config.port_override = Some(
                    args[i + 1]
                        .parse()
                        .map_err(|_| format!("invalid port '{}'", args[i + 1]))?,
                );
                i += 2;
            }
            "--no-poll" => {
                config.poll_enabled = false;
                i += 1;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "run" => {
                config.command = AgentCommand::Run;
                i += 1;
            }
            "check" => {
                config.command = AgentCommand::Check;
                i += 1;
            }
            "status" => {
                config.command = AgentCommand::Status;
                i += 1;
            }
            "deploy" => {
                let revision = args
                    .get(i + 1)
                    .ok_or_else(|| "deploy requires a revision".to_string())?;
                config.command = AgentCommand::Deploy(revision.clone());
                i += 2;
            }
            other => return Err(format!("unknown argument '{}'", other)),
        }
    }

    Ok(config)
}

fn print_help() {
    println!("eeveon - lightweight CI/CD deploy agent");
    println!();
    println!("USAGE:");
    println!("    eeveon [OPTIONS] [COMMAND]");
    println!();
    println!("OPTIONS:");
    println!("    --port <PORT>    Override the listening port");
    println!("    --no-poll        Disable repository polling (deploy via API only)");
    println!("    -h, --help       Print help information");
    println!();
    println!("COMMANDS:");
    println!("    run              Run the agent (default)");
    println!("    check            Check upstream for a new revision and exit");
    println!("    deploy <REV>     Deploy a revision and exit");
    println!("    status           Print the installed revision and recent attempts");
    println!();
    println!("Configuration is read from EEVEON_* environment variables.");
}

fn main() -> ExitCode {
    let config = match parse_args() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Run 'eeveon --help' for usage.");
            return ExitCode::from(2);
        }
    };

    let rt = tokio::runtime::Runtime::new().expect("Failed to create runtime");
    rt.block_on(eeveon::init_and_run_agent_with_config(config))
}
