use std::{
    error::Error,
    io::{self, BufRead, Write},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use clap::Parser;
use simpledb::{Constant, DbConfig, DbResult, FieldType, SimpleDB, Transaction};
use tracing_subscriber::EnvFilter;

/// An interactive SQL shell over a SimpleDB database directory
#[derive(Parser, Debug)]
#[command(name = "simpledb", version)]
struct Args {
    /// Database directory, created if it does not exist
    #[arg(long, default_value = "./simpledb-data")]
    dir: PathBuf,

    #[arg(long, default_value_t = DbConfig::BLOCK_SIZE)]
    block_size: usize,

    /// Number of frames in the buffer pool
    #[arg(long, default_value_t = DbConfig::NUM_BUFFERS)]
    buffers: usize,

    #[arg(long, default_value_t = DbConfig::LOCK_TIMEOUT_MS)]
    lock_timeout_ms: u64,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let config = DbConfig::new(args.block_size, args.buffers)
        .with_lock_timeout(Duration::from_millis(args.lock_timeout_ms));
    let db = SimpleDB::with_config(&args.dir, config)?;

    println!("SimpleDB CLI v{}", env!("CARGO_PKG_VERSION"));
    println!("Type 'help' for commands, 'quit' to exit");
    println!();

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("simpledb> ");
        io::stdout().flush()?;

        let Some(line) = lines.next() else {
            break;
        };
        let line = line?;
        let input = line.trim().trim_end_matches(';').trim();
        let lowered = input.to_lowercase();

        let result = match lowered.as_str() {
            "" => continue,
            "quit" | "exit" => {
                println!("Goodbye!");
                break;
            }
            "help" => {
                show_help();
                continue;
            }
            "show tables" => show_tables(&db),
            "show buffers" => Ok(show_buffers(&db)),
            _ => match lowered.strip_prefix("describe ") {
                Some(table_name) => describe_table(&db, table_name.trim()),
                None => execute_sql(&db, input),
            },
        };
        match result {
            Ok(output) => println!("{output}"),
            Err(e) => println!("Error: {e}"),
        }
    }

    Ok(())
}

fn show_help() {
    println!("SimpleDB CLI Commands:");
    println!("  help                - Show this help message");
    println!("  quit/exit           - Exit the CLI");
    println!("  show tables         - List all tables");
    println!("  describe <table>    - Show table schema, statistics and indexes");
    println!("  show buffers        - Display buffer pool contents and hit rate");
    println!();
    println!("Supported SQL:");
    println!("  create table t (f1 int, f2 varchar(n), ...)");
    println!("  create view v as select ...");
    println!("  create index i on t (f)");
    println!("  insert into t (f1, f2) values (v1, v2)");
    println!("  select f1, f2 from t1, t2 where f1 = f2 and f1 = 3");
    println!("  update t set f = value where ...");
    println!("  delete from t where ...");
}

/// Run `f` in a fresh transaction, committing on success and rolling back on failure
fn in_transaction<T>(
    db: &SimpleDB,
    f: impl FnOnce(&Arc<Transaction>) -> DbResult<T>,
) -> DbResult<T> {
    let txn = db.new_tx()?;
    match f(&txn) {
        Ok(value) => {
            txn.commit()?;
            Ok(value)
        }
        Err(e) => {
            txn.rollback()?;
            Err(e)
        }
    }
}

fn show_tables(db: &SimpleDB) -> DbResult<String> {
    let tables = in_transaction(db, |txn| db.metadata_manager().get_table_names(txn))?;
    let mut result = String::from("Tables:");
    for table in tables {
        result.push_str(&format!("\n  - {table}"));
    }
    Ok(result)
}

fn show_buffers(db: &SimpleDB) -> String {
    let buffer_manager = db.buffer_manager();
    let (hits, misses) = buffer_manager.stats().get();
    let mut result = format!(
        "Buffer Pool Information:\n  Available buffers: {}\n  Hits: {hits}, misses: {misses}, hit rate: {:.1}%\n",
        buffer_manager.available(),
        buffer_manager.stats().hit_rate() * 100.0
    );
    result.push_str(&format!("{:<6} {:<32} {:<6} {:<10}\n", "Frame", "Block", "Pins", "Dirty by"));
    for (i, frame) in buffer_manager.frames().iter().enumerate() {
        let block = frame
            .block_id
            .as_ref()
            .map_or_else(|| "-".to_string(), |b| b.to_string());
        let dirty = frame
            .modified_by
            .map_or_else(|| "-".to_string(), |tx| tx.to_string());
        result.push_str(&format!("{i:<6} {block:<32} {:<6} {dirty:<10}\n", frame.pins));
    }
    result
}

fn describe_table(db: &SimpleDB, table_name: &str) -> DbResult<String> {
    in_transaction(db, |txn| {
        let metadata_manager = db.metadata_manager();
        let layout = metadata_manager.get_layout(table_name, txn)?;
        let stat_info = metadata_manager.get_stat_info(table_name, &layout, txn)?;
        let indexes = metadata_manager.get_index_info(table_name, txn)?;

        let mut result = format!("Table: {table_name}\n");
        result.push_str(&format!("Slot Size: {} bytes\n", layout.slot_size()));
        result.push_str(&format!(
            "Statistics: {} blocks, {} records\n",
            stat_info.blocks_accessed(),
            stat_info.records_output()
        ));
        result.push_str("\nFields:\n");
        result.push_str(&format!("{:<20} {:<15}\n", "Name", "Type"));
        result.push_str(&format!("{}\n", "-".repeat(35)));
        for field in &layout.schema.fields {
            let field_info = &layout.schema.info[field];
            let type_str = match field_info.field_type {
                FieldType::Int => "int".to_string(),
                FieldType::String => format!("varchar({})", field_info.length),
            };
            result.push_str(&format!("{field:<20} {type_str:<15}\n"));
        }

        if !indexes.is_empty() {
            result.push_str("\nIndexes:\n");
            for (field_name, index_info) in &indexes {
                result.push_str(&format!(
                    "  - {} on {field_name}: search cost {} blocks, {} records per key\n",
                    index_info.index_name(),
                    index_info.blocks_accessed(),
                    index_info.records_output(),
                ));
            }
        }
        Ok(result)
    })
}

fn execute_sql(db: &SimpleDB, sql: &str) -> DbResult<String> {
    if sql.to_lowercase().starts_with("select") {
        in_transaction(db, |txn| execute_query(db, sql, txn))
    } else {
        in_transaction(db, |txn| {
            let affected_rows = db.planner().execute_update(sql, txn)?;
            Ok(format!("{affected_rows} row(s) affected."))
        })
    }
}

fn execute_query(db: &SimpleDB, sql: &str, txn: &Arc<Transaction>) -> DbResult<String> {
    let plan = db.planner().create_query_plan(sql, txn)?;
    let fields = plan.schema().fields.clone();
    let mut scan = plan.open()?;

    let mut result = String::new();
    result.push_str(&format!("{}\n", fields.join(" | ")));
    result.push_str(&format!(
        "{}\n",
        fields
            .iter()
            .map(|f| "-".repeat(f.len()))
            .collect::<Vec<_>>()
            .join("-|-")
    ));

    let rows = (|| -> DbResult<usize> {
        let mut row_count = 0;
        while scan.next()? {
            let mut row_values = Vec::with_capacity(fields.len());
            for field in &fields {
                row_values.push(format_value(&scan.get_value(field)?));
            }
            result.push_str(&format!("{}\n", row_values.join(" | ")));
            row_count += 1;
        }
        Ok(row_count)
    })();
    scan.close();

    match rows? {
        0 => result.push_str("No results found."),
        n => result.push_str(&format!("\n{n} row(s) returned.")),
    }
    Ok(result)
}

fn format_value(value: &Constant) -> String {
    match value {
        Constant::Int(i) => i.to_string(),
        Constant::String(s) => s.clone(),
    }
}
