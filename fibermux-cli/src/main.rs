// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::Result;
use clap::{Arg, ArgMatches, Command};
use fibermux::{
  common::service::{ServiceParameters, ServiceRegistry},
  util,
};

use util::validators::{
  parse_local_id, parse_parameter, parse_parameters_json, validate_local_id, validate_parameter,
  validate_parameters_json,
};

mod loopback;

fn cli() -> Command<'static> {
  Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .subcommand(
      Command::new("services")
        .alias("list")
        .about("List the service types this build can run")
        .arg(
          Arg::new("json")
            .long("json")
            .help("Print the list as a JSON array"),
        ),
    )
    .subcommand(
      Command::new("loopback")
        .about("Run one service over an in-memory multiplexer and talk to it through a fiber")
        .arg(
          Arg::new("service")
            .long("service")
            .short('s')
            .takes_value(true)
            .default_value("echo"),
        )
        .arg(
          Arg::new("local-id")
            .long("local-id")
            .visible_alias("id")
            .short('i')
            .help("Local id to bind the service to; assigned automatically if omitted")
            .validator(validate_local_id)
            .takes_value(true),
        )
        .arg(
          Arg::new("param")
            .long("param")
            .short('p')
            .help("Service parameter as key=value; may be repeated")
            .validator(validate_parameter)
            .takes_value(true)
            .multiple_occurrences(true),
        )
        .arg(
          Arg::new("params-json")
            .long("params-json")
            .help("Service parameters as a JSON object of strings; --param entries take precedence")
            .validator(validate_parameters_json)
            .takes_value(true),
        )
        .arg(
          Arg::new("message")
            .long("message")
            .short('m')
            .help("Send this message and print the reply instead of relaying stdin and stdout")
            .takes_value(true),
        )
        .arg(
          Arg::new("datagram")
            .long("datagram")
            .short('d')
            .help("Send the message as a datagram rather than over a stream fiber")
            .requires("message"),
        ),
    )
    .subcommand_required(true)
    .arg_required_else_help(true)
}

fn main() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  let collector = tracing_subscriber::fmt()
    .with_writer(std::io::stderr)
    .with_env_filter(env_filter)
    .finish();
  tracing::subscriber::set_global_default(collector).expect("Logger init must succeed");
  let matches = cli().get_matches();
  let mode = matches.subcommand_name().unwrap_or("<No subcommand?>");
  let handler = main_args_handler(&matches);
  let rt = tokio::runtime::Builder::new_multi_thread()
    .thread_name("tokio-reactor-worker")
    .enable_all()
    .build()
    .expect("Tokio Runtime setup failure");
  match rt.block_on(handler) {
    Err(err) => {
      tracing::error!(mode = mode, err = ?err, "dispatch_command_failure");
      std::process::exit(1);
    }
    Ok(_) => tracing::debug!("{} exited successfully", mode),
  }
}

pub fn loopback_arg_handling(args: &'_ ArgMatches) -> Result<loopback::LoopbackArgs> {
  let mut params = args
    .value_of("params-json")
    .map(parse_parameters_json)
    .transpose()?
    .unwrap_or_else(ServiceParameters::new);
  for param in args.values_of("param").into_iter().flatten() {
    let (key, value) = parse_parameter(param)?;
    params.insert(key, value);
  }
  Ok(loopback::LoopbackArgs {
    service: args
      .value_of("service")
      .expect("Service has a default value")
      .to_string(),
    local_id: args.value_of("local-id").map(parse_local_id).transpose()?,
    params,
    message: args.value_of("message").map(String::from),
    datagram: args.is_present("datagram"),
  })
}

fn list_services(json: bool) -> Result<()> {
  let service_types = ServiceRegistry::with_builtin().service_types();
  if json {
    println!("{}", serde_json::to_string(&service_types)?);
  } else {
    for service_type in service_types {
      println!("{}", service_type);
    }
  }
  Ok(())
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  match matches
    .subcommand()
    .expect("Subcommand is marked as required")
  {
    ("services", opts) => list_services(opts.is_present("json")),
    ("loopback", opts) => {
      let config = loopback_arg_handling(opts)?;
      tracing::debug!("Running loopback session with config {:#?}", config);
      loopback::loopback_main(config).await
    }
    (_, _) => unreachable!(),
  }
}
