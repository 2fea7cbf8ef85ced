use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ferrodb_core::{ChangesOptions, Document, FindQuery, SearchQuery, Storage, ViewQuery};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "ferrodb")]
#[command(about = "FerroDB CLI - operate a FerroDB database directory")]
#[command(version)]
struct Cli {
    /// Directory with databases
    #[arg(long, default_value = "./dbs")]
    dbs: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a database
    CreateDb {
        /// Database name
        name: String,
    },
    /// List databases
    ListDbs,
    /// Delete a database with all its data
    DeleteDb {
        name: String,
    },
    /// Store a document (JSON body on the command line)
    Put {
        db: String,
        /// Document body, e.g. '{"_id":"x","n":1}'
        json: String,
    },
    /// Fetch a document by id
    Get {
        db: String,
        id: String,
    },
    /// Delete a document
    Delete {
        db: String,
        id: String,
        /// Current revision of the document
        #[arg(long)]
        rev: String,
    },
    /// Run a Mango find query
    Find {
        db: String,
        /// Query body, e.g. '{"selector":{"year":1984}}'
        json: String,
    },
    /// Query a view
    View {
        db: String,
        /// Design document id, e.g. _design/d
        ddoc: String,
        view: String,
        #[arg(long)]
        group: bool,
    },
    /// Query a search index
    Search {
        db: String,
        /// Design document id, e.g. _design/s
        ddoc: String,
        index: String,
        /// Query string, e.g. 'name:Foo'
        query: String,
    },
    /// Read the change feed
    Changes {
        db: String,
        #[arg(long, default_value = "0")]
        since: String,
        /// Wait this many milliseconds when there is nothing to report
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Show queued background tasks
    Tasks {
        db: String,
    },
    /// Import documents from a JSON file (array of document bodies)
    Import {
        db: String,
        /// JSON file to import
        file: PathBuf,
    },
    /// Export all documents of a database to a JSON file
    Export {
        db: String,
        /// Output JSON file
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    ferrodb_core::logging::init_from_env();

    let cli = Cli::parse();
    let storage = Storage::open(&cli.dbs)
        .with_context(|| format!("failed to open database dir {:?}", cli.dbs))?;

    match cli.command {
        Commands::CreateDb { name } => {
            storage.create_database(&name)?;
            println!("created {:?}", name);
        }
        Commands::ListDbs => {
            for name in storage.databases() {
                println!("{}", name);
            }
        }
        Commands::DeleteDb { name } => {
            storage.delete_database(&name)?;
            println!("deleted {:?}", name);
        }
        Commands::Put { db, json } => {
            let body: Value = serde_json::from_str(&json).context("invalid JSON body")?;
            let doc = Document::from_json_value(body)?;
            let db = storage.create_database(&db)?;
            let rev = db.put_document(doc)?;
            println!("{}", rev);
        }
        Commands::Get { db, id } => {
            let db = storage.database(&db)?;
            let doc = db.get_document(&id)?;
            println!("{}", serde_json::to_string_pretty(&doc.to_json_value())?);
        }
        Commands::Delete { db, id, rev } => {
            let db = storage.database(&db)?;
            let rev = db.delete_document(&id, &rev)?;
            println!("{}", rev);
        }
        Commands::Find { db, json } => {
            let body: Value = serde_json::from_str(&json).context("invalid query")?;
            let query = FindQuery::from_json(&body)?;
            let db = storage.database(&db)?;
            let result = db.find_docs(&query)?;
            for doc in result.docs {
                println!("{}", serde_json::to_string(&doc.to_json_value())?);
            }
        }
        Commands::View { db, ddoc, view, group } => {
            let db = storage.database(&db)?;
            let result = db.query_view(
                &ddoc,
                &view,
                &ViewQuery {
                    group,
                    ..ViewQuery::default()
                },
            )?;
            for row in result.rows {
                println!(
                    "{}",
                    serde_json::json!({ "key": row.key, "value": row.value })
                );
            }
        }
        Commands::Search { db, ddoc, index, query } => {
            let db = storage.database(&db)?;
            let result = db.search(
                &ddoc,
                &index,
                &SearchQuery {
                    query,
                    ..SearchQuery::default()
                },
            )?;
            println!("total: {}", result.total);
            for record in result.records {
                println!(
                    "{}",
                    serde_json::json!({
                        "id": record.id,
                        "order": record.order,
                        "fields": record.fields,
                    })
                );
            }
        }
        Commands::Changes { db, since, timeout } => {
            let db = storage.database(&db)?;
            let response = db.changes(&ChangesOptions {
                since,
                limit: 0,
                timeout: timeout.map(Duration::from_millis),
            })?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Tasks { db } => {
            let db = storage.database(&db)?;
            for task in db.peek_tasks(100)? {
                println!("{}", task);
            }
        }
        Commands::Import { db, file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {:?}", file))?;
            let bodies: Vec<Value> = serde_json::from_str(&raw).context("invalid JSON file")?;

            let mut docs = Vec::with_capacity(bodies.len());
            for body in bodies {
                docs.push(Document::from_json_value(body)?);
            }

            let db = storage.create_database(&db)?;
            let mut imported = 0;
            for result in db.bulk_docs(docs) {
                match result.error {
                    Some(err) => eprintln!("skipping {:?}: {}", result.id, err),
                    None => imported += 1,
                }
            }
            println!("imported {} documents", imported);
        }
        Commands::Export { db, file } => {
            let db = storage.database(&db)?;
            let (docs, _) = db.all_docs(&ferrodb_core::AllDocsQuery {
                include_docs: true,
                ..Default::default()
            })?;

            let bodies: Vec<Value> = docs.iter().map(|d| d.to_json_value()).collect();
            std::fs::write(&file, serde_json::to_string_pretty(&bodies)?)
                .with_context(|| format!("failed to write {:?}", file))?;
            println!("exported {} documents", bodies.len());
        }
    }

    Ok(())
}
