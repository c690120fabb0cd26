use std::{
    error::Error,
    io::{self, BufRead, Write},
    path::PathBuf,
    thread,
};

use clap::{Parser, Subcommand};
use roosty_alarms::{
    alarm::MAX_MESSAGE_LEN,
    command::Command,
    communication::Notifier,
    config::Config,
    AlarmListing, AlarmSystem,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// config file to use instead of the platform default
    #[clap(long, short)]
    config: Option<PathBuf>,
    #[clap(subcommand)]
    command: Option<Action>,
}

#[derive(Subcommand)]
enum Action {
    /// write the default config file
    Init {
        #[clap(long, short)]
        force: bool,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    // initilize the logger
    simple_file_logger::init_logger!("roosty_alarms").expect("couldn't initialize logger");

    let args = Args::parse();
    let config_path = match args.config {
        Some(path) => path,
        None => Config::config_path()?,
    };
    if let Some(Action::Init { force }) = args.command {
        if force || !config_path.exists() {
            Config::new().save(&config_path)?;
            println!("wrote {}", config_path.display());
        } else {
            println!("{} already exists, use --force to overwrite", config_path.display());
        }
        return Ok(());
    }
    let config = Config::load_or_default(&config_path)?;

    let (notifier, rx) = Notifier::channel();
    thread::spawn(move || {
        for notification in rx {
            println!("{notification}");
        }
    });
    let system = AlarmSystem::start(&config, notifier)?;

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("alarm> ");
        io::stdout().flush()?;
        let Some(line) = lines.next().transpose()? else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        match line.parse::<Command>() {
            Ok(command) => run(&system, command),
            Err(err) => eprintln!("ERROR: {err}"),
        }
    }
    system.shutdown();
    Ok(())
}

fn run(system: &AlarmSystem, command: Command) {
    let result = match command {
        Command::Start {
            id,
            category,
            interval,
            message,
        } => system
            .start_alarm(id, &category, interval, &message)
            .map(|fit| {
                if fit.is_truncated() {
                    eprintln!("WARNING: message truncated to {MAX_MESSAGE_LEN} characters");
                }
                println!("Alarm({id}) set for {interval} seconds: {message}");
            }),
        Command::Change {
            id,
            interval,
            message,
        } => system.change_alarm(id, interval, &message).map(|fit| {
            if fit.is_truncated() {
                eprintln!("WARNING: message truncated to {MAX_MESSAGE_LEN} characters");
            }
            println!("Alarm({id}) changed to {interval} seconds: {message}");
        }),
        Command::Cancel(id) => system
            .cancel_alarm(id)
            .map(|()| println!("Alarm({id}) cancelled")),
        Command::View => system.list_alarms().map(|listing| print_listing(&listing)),
    };
    if let Err(err) = result {
        log::warn!("{err}");
        eprintln!("ERROR: {err}");
    }
}

fn print_listing(listing: &AlarmListing) {
    println!("Viewing all alarms:");
    for (i, alarm) in listing.alarms.iter().enumerate() {
        println!(
            "Alarm {}: {} {}s - {}{}",
            i + 1,
            alarm.category,
            alarm.interval,
            alarm.message,
            if alarm.assigned { "" } else { " (waiting)" }
        );
    }
    for group in &listing.groups {
        println!("Display group {} ({}):", group.id, group.category);
        for alarm in &group.alarms {
            println!("  {alarm}");
        }
    }
}
