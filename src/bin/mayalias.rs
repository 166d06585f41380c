use std::{fs::File, path::PathBuf};

use clap::{Parser, Subcommand};
use mayalias::*;

#[derive(Subcommand, Debug)]
enum Command {
    /// Compute points-to sets for every value of the program.
    May {
        #[arg(short, long)]
        dump: Option<PathBuf>,
        #[arg(short, long)]
        eager: bool,
        #[arg(long)]
        dist: Option<usize>,
    },
    /// Restore points-to sets from a dump and print them.
    Show {
        #[arg(short, long)]
        load: PathBuf,
        #[arg(short, long)]
        peek: Option<usize>,
    },
}

#[derive(Parser, Debug)]
struct Args {
    #[arg(short, long)]
    log: Option<PathBuf>,

    input: PathBuf,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let args = Args::parse();

    if let Some(log) = args.log {
        let log_file = File::create(log).unwrap();
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(log_file)
            .init();
    }

    let text = std::fs::read_to_string(&args.input).unwrap();
    let db = ir::parse(&text).unwrap();
    let start = std::time::Instant::now();
    match args.command {
        Command::May { dump, eager, dist } => {
            let conf = points_to::Config {
                lazy: !eager,
                ..Default::default()
            };
            let mut pts = points_to::PointsToSets::new(&db, conf);
            let mut values = vec![];
            db.walk_values(|v| values.push(v));
            for v in values {
                pts.points_to_set(v);
            }
            if let Some(dump) = dump {
                pts.save(&dump).unwrap();
            }
            if let Some(peek) = dist {
                pts.draw_points_to_sets_distribution(peek);
            } else {
                pts.print(&mut std::io::stdout()).unwrap();
            }
        }
        Command::Show { load, peek } => {
            let pts = points_to::PointsToSets::load(&db, &load, Default::default()).unwrap();
            pts.print(&mut std::io::stdout()).unwrap();
            if let Some(peek) = peek {
                pts.draw_points_to_sets_distribution(peek);
            }
        }
    }
    let elapsed = start.elapsed();
    println!("{}", elapsed.as_millis());
}
