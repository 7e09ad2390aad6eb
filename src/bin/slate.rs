use std::{
    error::Error,
    io::{self, Write},
    path::PathBuf,
    process,
    sync::Arc,
};

use clap::Parser;
use log::{error, info};
use slate::*;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to data directory
    path: PathBuf,
    /// Database to open
    #[arg(short, long, default_value = "main")]
    database: String,
    /// Table to open
    #[arg(short, long)]
    table: String,
    /// Table schema, e.g. `id:int32,name:string`
    #[arg(short, long)]
    schema: String,
    /// Read/write buffer size of block files, in bytes
    #[arg(long, default_value_t = 64 * 1024)]
    buffer_size: usize,
    /// Disable the write-ahead log
    #[arg(long)]
    no_wal: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let config = Config::new(cli.path)
        .with_buffer_size(cli.buffer_size)
        .with_wal(!cli.no_wal);
    let engine = Engine::open(config)?;

    {
        let engine = Arc::clone(&engine);
        ctrlc::set_handler(move || {
            info!("interrupted, checkpointing");
            let code = match engine.checkpoint() {
                Ok(()) => 130,
                Err(e) => {
                    error!("checkpoint failed: {e}");
                    1
                }
            };
            process::exit(code);
        })?;
    }

    let schema = Schema::parse(&cli.schema)?;
    let table = engine
        .create_database(&cli.database)?
        .open_table(&cli.table, schema)?;
    let mut ctx = engine.context(true)?;

    let stdio = io::stdin();
    let stdout = io::stdout();

    loop {
        let reader = stdio.lock();
        let writer = StdOut {
            inner: stdout.lock(),
        };

        let cmd = match prompt(reader, writer) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };

        match cmd {
            Command::Exit => break,
            Command::Flush => match engine.checkpoint() {
                Ok(()) => println!("flushed"),
                Err(e) => eprintln!("flush error: {e}"),
            },
            Command::Schema => println!("{}", table.schema()),
            Command::Statement(s) if s.is_empty() => {}
            cmd => match Statement::try_from(cmd).and_then(|stmt| stmt.execute(&table, &mut ctx)) {
                Ok(out) => println!("{out}"),
                Err(e) => eprintln!("query error: {e}"),
            },
        }
    }

    ctx.close()?;
    if let Err(e) = engine.checkpoint() {
        eprintln!("failed to safely close database. error: {e}");
    }
    Ok(())
}

/// StdOut wrapper that flushes content after every write.
struct StdOut<W: io::Write> {
    inner: W,
}

impl<W: io::Write> Write for StdOut<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let res = self.inner.write(buf);
        if res.is_ok() {
            self.inner.flush()?
        }
        res
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
