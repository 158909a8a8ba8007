use anyhow::{Context, Result};
use clap::Parser as _;
use farecard::dump::Dump;
use farecard::registry::{Decoded, Identification, Registry};
use farecard::transit::{zones, Balance, FormatOptions, Subscription, Timestamp, TransitRecord, Trip};
use owo_colors::{colors, OwoColorize};
use pad::PadStr;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, trace_span};

type ColorName = colors::Cyan;
type ColorSerial = colors::Yellow;
type ColorTag = colors::Magenta;
type ColorMoney = colors::Green;
type ColorLocked = colors::Red;

#[derive(clap::Parser, Debug)]
struct Args {
    /// Increase log level.
    #[arg(short, long, action=clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease log level.
    #[arg(short, long, action=clap::ArgAction::Count)]
    quiet: u8,

    /// Mask card numbers in the output.
    #[arg(long, global = true)]
    hide_serials: bool,

    /// Command.
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Identify the card in a dump.
    Identify { path: PathBuf },

    /// Decode the card in a dump.
    Decode {
        path: PathBuf,

        /// Print the record as JSON.
        #[arg(long)]
        json: bool,

        /// Decode with this scheme (tag or alias) instead of the one picked automatically.
        #[arg(long)]
        scheme: Option<String>,
    },

    /// Print the fare zones travelled between two stops.
    Zones {
        start: String,
        end: String,

        /// Airtrain stops don't count towards the span.
        #[arg(long)]
        exempt: bool,
    },

    /// List supported schemes, in the order they're tried.
    Schemes,
}

impl Command {
    pub fn run(&self, args: &Args) -> Result<()> {
        let opts = FormatOptions {
            hide_serials: args.hide_serials,
        };
        match self {
            Self::Identify { path } => identify(path, &opts),
            Self::Decode { path, json, scheme } => decode(path, *json, scheme.as_deref(), &opts),
            Self::Zones { start, end, exempt } => {
                let zones = zones::zones(start, end, *exempt)
                    .with_context(|| format!("Can't work out zones for {:?} to {:?}", start, end))?;
                println!("{}", zones.join(", "));
                Ok(())
            }
            Self::Schemes => {
                list_schemes();
                Ok(())
            }
        }
    }
}

fn load(path: &Path) -> Result<Dump> {
    let span = trace_span!("load", ?path);
    let _enter = span.enter();

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Couldn't read {}", path.display()))?;
    let dump = Dump::from_json(&raw).with_context(|| format!("Couldn't load {}", path.display()))?;
    debug!(tag_id = hex::encode_upper(&dump.tag_id), "Loaded dump");
    Ok(dump)
}

fn identify(path: &Path, opts: &FormatOptions) -> Result<()> {
    let dump = load(path)?;
    let registry = Registry::default();
    match dump.identify(&registry).context("Couldn't identify card")? {
        Identification::Known { tag, identity } => {
            let serial = identity.serial.map(|s| redact(s, opts));
            println!(
                "{} {} {}",
                identity.name.fg::<ColorName>(),
                serial.unwrap_or_default().fg::<ColorSerial>(),
                format!("({})", tag).fg::<ColorTag>(),
            );
        }
        Identification::Locked { tag, identity } => println!(
            "{} {}",
            identity.name.fg::<ColorLocked>(),
            format!("({})", tag).fg::<ColorTag>(),
        ),
        Identification::Unknown => println!("{}", "Unknown card".italic()),
    }
    Ok(())
}

fn redact(serial: String, opts: &FormatOptions) -> String {
    if opts.hide_serials {
        farecard::transit::obfuscate(&serial)
    } else {
        serial
    }
}

fn decode(path: &Path, json: bool, scheme: Option<&str>, opts: &FormatOptions) -> Result<()> {
    let mut dump = load(path)?;
    if let Some(tag) = scheme {
        debug!(tag, "Overriding scheme");
        dump.scheme = Some(tag.to_string());
    }

    let registry = Registry::default();
    let decoded = dump.decode(&registry).context("Couldn't decode card")?;
    let (tag, locked) = match &decoded {
        Decoded::Known { tag, .. } => (*tag, false),
        Decoded::Locked { tag, .. } => (*tag, true),
        Decoded::Unknown => {
            println!("{}", "Unknown card".italic());
            return Ok(());
        }
    };
    let Some(record) = decoded.record() else {
        return Ok(());
    };
    let record = record.clone().redacted(opts);

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        print_record(tag, locked, &record);
    }
    Ok(())
}

fn time(ts: &Option<Timestamp>) -> String {
    ts.map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "?".into())
}

fn print_record(tag: &str, locked: bool, record: &TransitRecord) {
    if locked {
        print!("┏╸{}", record.card_name.fg::<ColorLocked>());
    } else {
        print!("┏╸{}", record.card_name.fg::<ColorName>());
    }
    if let Some(serial) = &record.serial {
        print!("╺ {}", serial.fg::<ColorSerial>());
    }
    println!(" {}", format!("({})", tag).fg::<ColorTag>());

    for balance in &record.balances {
        print_balance(balance);
    }
    for sub in &record.subscriptions {
        println!(
            " ┠─╴{} {}",
            "Subscription".italic(),
            match sub {
                Subscription::TravelPass { valid_until } =>
                    format!("travel pass, valid until {}", time(valid_until)),
                Subscription::UnusedPass => "unused pass".into(),
                Subscription::AutoTopUp => "auto top-up".into(),
            }
        );
    }
    for (label, value) in &record.info {
        println!(" ┠─╴{}: {}", label.italic(), value);
    }
    if !record.trips.is_empty() {
        println!(" ┠─╴{}", "Trips".italic());
        for trip in &record.trips {
            print_trip(trip);
        }
    }
    if !record.refills.is_empty() {
        println!(" ┠─╴{}", "Refills".italic());
        for refill in &record.refills {
            print!(
                " ┃  ┠─╴{} {}",
                time(&refill.time),
                refill.amount.fg::<ColorMoney>()
            );
            if let Some(agency) = &refill.agency {
                print!(" {}", agency);
            }
            if refill.automatic {
                print!(" {}", "(auto)".italic());
            }
            println!();
        }
    }
    println!("┗");
}

fn print_balance(balance: &Balance) {
    print!(
        " ┠─╴{} {}",
        balance.label.as_deref().unwrap_or("Balance").italic(),
        balance.money.fg::<ColorMoney>()
    );
    if balance.valid_from.is_some() || balance.valid_until.is_some() {
        print!(
            " (valid {} to {})",
            time(&balance.valid_from),
            time(&balance.valid_until)
        );
    }
    println!();
}

fn print_trip(trip: &Trip) {
    print!(" ┃  ┠─╴{} {}", time(&trip.sort_time()), trip.mode);
    if let Some(route) = &trip.route {
        print!(" {}", route);
    }
    match (&trip.start_station, &trip.end_station) {
        (Some(a), Some(b)) => print!(" {} → {}", a, b),
        (Some(a), None) => print!(" {}", a),
        (None, Some(b)) => print!(" → {}", b),
        (None, None) => {}
    }
    if let Some(fare) = &trip.fare {
        print!(" {}", fare.fg::<ColorMoney>());
    }
    if let Some(agency) = &trip.agency {
        print!(" [{}]", agency);
    }
    if trip.transfer {
        print!(" {}", "(transfer)".italic());
    }
    println!();
}

fn list_schemes() {
    for (i, scheme) in Registry::default().schemes().enumerate() {
        println!(
            "{:>3}  {}{}{}",
            i,
            scheme.tag().pad_to_width(20).fg::<ColorTag>(),
            scheme.technology().to_string().pad_to_width(20),
            scheme.aliases().join(", ")
        );
    }
}

/// Default INFO; each -v/-q moves one level, clamped at the ends.
fn log_level(verbose: u8, quiet: u8) -> tracing::Level {
    match 2u8.saturating_add(verbose).saturating_sub(quiet) {
        0 => tracing::Level::ERROR,
        1 => tracing::Level::WARN,
        2 => tracing::Level::INFO,
        3 => tracing::Level::DEBUG,
        4.. => tracing::Level::TRACE,
    }
}

fn init_logging(args: &Args) {
    tracing_subscriber::fmt()
        .without_time()
        .with_target(false)
        .with_max_level(log_level(args.verbose, args.quiet))
        .init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);
    trace!(?args, "Starting up");
    args.command.run(&args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser as _;

    #[test]
    fn test_log_level() {
        assert_eq!(log_level(0, 0), tracing::Level::INFO);
        assert_eq!(log_level(2, 0), tracing::Level::TRACE);
        assert_eq!(log_level(9, 0), tracing::Level::TRACE);
        assert_eq!(log_level(0, 2), tracing::Level::ERROR);
        assert_eq!(log_level(0, 3), tracing::Level::ERROR);
        assert_eq!(log_level(1, 2), tracing::Level::WARN);
        assert_eq!(log_level(u8::MAX, 0), tracing::Level::TRACE);
    }

    #[test]
    fn test_quiet_flags_parse() {
        let args = Args::try_parse_from(["farecard", "-qqq", "schemes"]).unwrap();
        assert_eq!(args.quiet, 3);
        assert_eq!(log_level(args.verbose, args.quiet), tracing::Level::ERROR);
    }
}
