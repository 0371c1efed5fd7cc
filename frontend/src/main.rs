use clap::{App, Arg};
use std::process;
use tether::channel::{Channel, ChannelState};
use tether::dispatch::Dispatcher;
use tether::logging;
use tether::serial::SerialLink;

pub fn main() {
    let matches = App::new("Offload Frontend")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Executes serialized function calls from an attached target.")
        .arg(
            Arg::with_name("PORT")
                .long("port")
                .takes_value(true)
                .required(true)
                .help("Serial device the target is attached to"),
        )
        .arg(
            Arg::with_name("ARGS")
                .multiple(true)
                .last(true)
                .help("Arguments forwarded to the target program"),
        )
        .get_matches();

    let device = matches.value_of("PORT").unwrap();
    let forwarded: Vec<String> = matches
        .values_of("ARGS")
        .map(|values| values.map(str::to_string).collect())
        .unwrap_or_default();

    let log = logging::init();

    logging::info!(log, "starting frontend";
                   "device" => device,
                   "forwarded_args" => forwarded.len());

    let mut link = SerialLink::open(device, &log).expect("Error opening serial device");

    // Reset the target so both sides start from a clean frame stream.
    link.send_break();

    let mut channel = Channel::new(link, &log);
    let mut dispatcher = Dispatcher::new(&log);

    if channel.greet(&forwarded).is_err() {
        logging::error!(log, "handshake failed");
    }

    let state = match channel.state() {
        ChannelState::Ok => channel.run(&mut dispatcher),
        dead => dead,
    };

    let code = match state {
        ChannelState::Exited(code) => code,
        ChannelState::Dead(status) => status.code(),
        // The loop only returns on a terminal state; treat anything else
        // as a clean shutdown.
        _ => 0,
    };

    logging::info!(log, "frontend finished"; "exit_code" => code);

    process::exit(code as i32);
}
