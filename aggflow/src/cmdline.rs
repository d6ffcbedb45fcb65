use std::path::PathBuf;

use clap::{Arg, ArgAction, Command};

pub(super) fn root_cli() -> Command {
    Command::new("aggflow")
        .about("Windowed, fault-tolerant stream aggregation")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(run_subcommand())
        .subcommand(validate_subcommand())
}

fn config_arg() -> Arg {
    Arg::new("config")
        .long("config")
        .short('c')
        .help("Path to the JSON pipeline spec. Defaults to the base64 spec in AGGFLOW_PIPELINE_SPEC")
        .action(ArgAction::Set)
        .value_parser(clap::value_parser!(PathBuf))
}

fn run_subcommand() -> Command {
    Command::new("run")
        .about("Run a pipeline until interrupted")
        .arg(config_arg())
        .arg(
            Arg::new("drain")
                .long("drain")
                .help("Consume a bounded source to its end, finalize every window and exit")
                .action(ArgAction::SetTrue),
        )
}

fn validate_subcommand() -> Command {
    Command::new("validate-config")
        .about("Parse and validate a pipeline spec, then print it")
        .arg(config_arg())
}
