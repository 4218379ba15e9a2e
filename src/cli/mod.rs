pub mod actions;
pub mod cleanup;
pub mod config;

use clap::{Arg, ArgAction, ArgMatches, Command};

fn device_arg() -> Arg {
    Arg::new("name")
        .help("Device name, bus address or gpib<N>")
        .value_name("NAME")
        .required(true)
}

fn options_arg() -> Arg {
    Arg::new("options")
        .help("Device option words (no_spoll, read_lf, stb_bit 1, ...)")
        .value_name("OPTION")
        .num_args(0..)
        .allow_hyphen_values(true)
}

fn device_command(name: &'static str, about: &'static str) -> Command {
    Command::new(name).about(about).arg(device_arg())
}

/// Build the command line definition.
pub fn command() -> Command {
    Command::new("gpibmux")
        .about("Talk to GPIB instruments through Prologix USB adapters")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .help("TOML file with bus settings and [[devices]] declarations")
                .value_name("FILE")
                .global(true),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .short('j')
                .help("Output results in JSON format")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .subcommand(Command::new("scan").about("Open every attached adapter and list them"))
        .subcommand(
            Command::new("find")
                .about("Serial-poll a range of bus addresses on every adapter")
                .arg(
                    Arg::new("begin")
                        .value_name("BEGIN")
                        .default_value("0")
                        .allow_negative_numbers(true)
                        .value_parser(clap::value_parser!(i64)),
                )
                .arg(
                    Arg::new("end")
                        .value_name("END")
                        .allow_negative_numbers(true)
                        .value_parser(clap::value_parser!(i64)),
                ),
        )
        .subcommand(
            Command::new("map")
                .about("Show or declare the address of a device name")
                .arg(device_arg())
                .arg(
                    Arg::new("address")
                        .value_name("ADDR")
                        .allow_negative_numbers(true)
                        .value_parser(clap::value_parser!(i64)),
                )
                .arg(options_arg()),
        )
        .subcommand(
            Command::new("links").about("Open every configured device and list the links"),
        )
        .subcommand(
            device_command("open", "Bind a device to the adapter it answers on")
                .arg(options_arg()),
        )
        .subcommand(device_command("status", "Read a device's status byte"))
        .subcommand(device_command("remote", "Address a device, putting it in remote mode"))
        .subcommand(device_command("local", "Return a device to front-panel control"))
        .subcommand(device_command("clear", "Send a selected device clear"))
        .subcommand(device_command("trigger", "Send a group execute trigger"))
        .subcommand(
            device_command("write", "Send data to a device and print its answer")
                .arg(
                    Arg::new("data")
                        .help("Message parts, sent back to back as one message")
                        .value_name("DATA")
                        .required(true)
                        .num_args(1..),
                )
                .arg(
                    Arg::new("binary")
                        .long("binary")
                        .help("Escape CR, LF and ESC and send no terminator characters")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("no-reply")
                        .long("no-reply")
                        .help("Do not wait for an answer")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(device_command("read", "Read everything a device has to say"))
}

/// Parse command line arguments and return ArgMatches.
pub fn parse_args() -> ArgMatches {
    command().get_matches()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_definition_is_valid() {
        command().debug_assert();
    }

    #[test]
    fn test_write_arguments() {
        let matches = command()
            .try_get_matches_from(["gpibmux", "--json", "write", "--binary", "dmm", "A", "B"])
            .unwrap();
        assert!(matches.get_flag("json"));
        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "write");
        assert!(sub.get_flag("binary"));
        let parts: Vec<&String> = sub.get_many::<String>("data").unwrap().collect();
        assert_eq!(parts, ["A", "B"]);
    }

    #[test]
    fn test_map_with_options() {
        let matches = command()
            .try_get_matches_from(["gpibmux", "map", "scope", "7", "stb_bit", "1"])
            .unwrap();
        let sub = matches.subcommand_matches("map").unwrap();
        assert_eq!(sub.get_one::<i64>("address"), Some(&7));
        let words: Vec<&String> = sub.get_many::<String>("options").unwrap().collect();
        assert_eq!(words, ["stb_bit", "1"]);
    }
}
