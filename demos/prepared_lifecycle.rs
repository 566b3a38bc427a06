//! Example: watching statements move through the prepared lifecycle
//!
//! Runs a few statements against the in-memory scripted server and prints
//! every request it received, first for a server with prepared statement
//! support and then for one without.
//!
//! ## Running
//!
//! ```bash
//! cargo run --example prepared_lifecycle
//! ```

use std::sync::Arc;

use mysqlx_prepared::replay::ScriptedProtocol;
use mysqlx_prepared::tracing_support::TestSpanEmitter;
use mysqlx_prepared::{PreparedStatementConfig, Session};

async fn run(label: &str, server: ScriptedProtocol) -> mysqlx_prepared::Result<()> {
    let server = Arc::new(server);
    let spans = Arc::new(TestSpanEmitter::new());
    let session = Session::with_emitter(
        server.clone(),
        PreparedStatementConfig::default(),
        spans.clone(),
    );

    let mut find = session.find("shop", "products");
    find.where_("price < :max").sort(["price DESC"]);
    for max in [10, 20, 50] {
        find.bind("max", max).execute().await?;
    }

    // a new filter throws the plan away
    find.where_("category = :category").bind("category", "books");
    find.execute().await?;
    find.execute().await?;

    println!("== {} ==", label);
    for span in spans.get_spans() {
        println!("  {}", span.summary());
    }
    println!(
        "  prepared statements still supported: {}",
        session.prepared_statement_supported()
    );
    match server.transcript().to_json() {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error serializing transcript: {:?}", e),
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run("server with prepared statements", ScriptedProtocol::new()).await {
        eprintln!("Error: {}", e);
    }
    if let Err(e) = run(
        "server without prepared statements",
        ScriptedProtocol::without_prepared_statements(),
    )
    .await
    {
        eprintln!("Error: {}", e);
    }
}
