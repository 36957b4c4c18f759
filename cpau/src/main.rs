mod client;
mod helpers;
mod identity;
mod install;
mod launcher;
mod messages;
mod native;
mod request_handler;
mod service;
mod tests;
mod tracing;
mod transport;

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use helpers::*;
use messages::*;
use std::io::BufRead;
use std::path::Path;
use std::time::Duration;
use windows::Win32::Foundation::*;

fn cpau_cli() -> Command {
    Command::new(env!("CARGO_CRATE_NAME"))
        .about("Starts processes in another user's desktop session through a privileged service.")
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("service")
                .about("Run as the service. Used by the service control manager.")
                .hide(true),
        )
        .subcommand(
            Command::new("install")
                .about("Install and start the service")
                .arg(
                    Arg::new("unsafe")
                        .long("unsafe")
                        .help("Skip checking who can modify the install directory")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(Command::new("uninstall").about("Stop and remove the service"))
        .subcommand(
            Command::new("launch")
                .about("Ask the service to start a process")
                .arg(
                    Arg::new("mode")
                        .long("mode")
                        .help("Whose identity the new process gets")
                        .value_parser(["inherit", "credentials"])
                        .default_value("inherit"),
                )
                .arg(Arg::new("domain").long("domain").help("Domain of the account"))
                .arg(Arg::new("username").long("username").help("Name of the account"))
                .arg(
                    Arg::new("password")
                        .long("password")
                        .help("Password of the account. Read from stdin when not given.")
                        .requires("unsafe"),
                )
                .arg(
                    Arg::new("unsafe")
                        .long("unsafe")
                        .help("Allow passing the password on the command line")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("working-directory")
                        .long("working-directory")
                        .help("Defaults to the executable's directory"),
                )
                .arg(
                    Arg::new("timeout")
                        .long("timeout")
                        .help("Milliseconds to wait for the service. 0 waits forever.")
                        .value_parser(value_parser!(u32)),
                )
                .arg(Arg::new("EXECUTABLE").required(true))
                .arg(
                    Arg::new("ARGS")
                        .num_args(0..)
                        .trailing_var_arg(true)
                        .allow_hyphen_values(true),
                ),
        )
}

fn read_password() -> std::io::Result<String> {
    eprint!("Password: ");
    let mut password = String::new();
    std::io::stdin().lock().read_line(&mut password)?;
    Ok(password.trim_end_matches(['\r', '\n']).to_string())
}

fn build_parameters(matches: &ArgMatches) -> windows::core::Result<Parameters> {
    let executable = matches
        .get_one::<String>("EXECUTABLE")
        .map(String::as_str)
        .unwrap_or_default();
    let executable_path = absolute_path(Path::new(executable))?;
    if !executable_path.is_file() {
        eprintln!("{}: no such file", executable_path.display());
        return Err(ERROR_FILE_NOT_FOUND.into());
    }

    let working_directory = match matches.get_one::<String>("working-directory") {
        Some(dir) => {
            let dir = absolute_path(Path::new(dir))?;
            if !dir.is_dir() {
                eprintln!("{}: no such directory", dir.display());
                return Err(ERROR_PATH_NOT_FOUND.into());
            }
            dir.to_string_lossy().into_owned()
        }
        None => String::new(),
    };

    let args: Vec<&String> = matches
        .get_many::<String>("ARGS")
        .map(|values| values.collect())
        .unwrap_or_default();

    let authentication_mode = match matches.get_one::<String>("mode").map(String::as_str) {
        Some("credentials") => AuthenticationMode::Credentials,
        _ => AuthenticationMode::Inherit,
    };

    let credentials = if authentication_mode == AuthenticationMode::Credentials {
        let Some(username) = matches.get_one::<String>("username") else {
            eprintln!("--username is required with --mode credentials");
            return Err(ERROR_INVALID_PARAMETER.into());
        };
        let password = match matches.get_one::<String>("password") {
            Some(password) => password.clone(),
            None => read_password().map_err(|_| windows::core::Error::from(ERROR_READ_FAULT))?,
        };
        Credentials {
            domain: matches.get_one::<String>("domain").cloned().unwrap_or_default(),
            username: username.clone(),
            password,
        }
    } else {
        Credentials::default()
    };

    Ok(Parameters {
        authentication_mode,
        credentials,
        process_information: ProcessInformation {
            executable_path: executable_path.to_string_lossy().into_owned(),
            arguments: join_args(&args),
            working_directory,
        },
        elevated: false,
    })
}

fn do_launch(matches: &ArgMatches) -> i32 {
    let parameters = match build_parameters(matches) {
        Ok(parameters) => parameters,
        Err(err) => return err.code().0,
    };

    // A broken config shouldn't keep anybody from at least trying the
    // default pipe.
    let config = load_config(&RegistryConfigProvider).unwrap_or_default();
    let timeout = match matches.get_one::<u32>("timeout") {
        Some(0) => None,
        Some(&ms) => Some(Duration::from_millis(ms.into())),
        None => config.client_timeout,
    };

    let result = client::create_process_as_user(&config.pipe_name, parameters, timeout);
    match result.result {
        ResultCode::CreatedProcess => println!("{}", result.process_id),
        code => eprintln!("{code}"),
    }
    i32::from(result.result)
}

fn report<E: std::fmt::Display>(outcome: Result<(), E>, done: &str) -> i32 {
    match outcome {
        Ok(()) => {
            println!("{done}");
            0
        }
        Err(err) => {
            eprintln!("{err}");
            1
        }
    }
}

fn cpau_main() -> i32 {
    tracing::enable_tracing();

    let matches = cpau_cli().get_matches();
    match matches.subcommand() {
        Some(("service", _)) => match service::run_dispatcher() {
            Ok(()) => 0,
            Err(err) => {
                // Most likely somebody ran this from a console.
                eprintln!("{err}");
                1
            }
        },
        Some(("install", m)) => report(install::install(m.get_flag("unsafe")), "Installed."),
        Some(("uninstall", _)) => report(install::uninstall(), "Uninstalled."),
        Some(("launch", m)) => do_launch(m),
        _ => unreachable!("subcommand_required"),
    }
}

fn main() {
    std::process::exit(cpau_main());
}
