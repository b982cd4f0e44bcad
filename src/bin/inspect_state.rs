use chrono::DateTime;
use sqlx::Row;
use sqlx::sqlite::SqlitePoolOptions;
use std::env;

fn show_time(millis: Option<i64>) -> String {
    match millis {
        Some(ms) => DateTime::from_timestamp_millis(ms)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| format!("invalid ({})", ms)),
        None => "-".to_string(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() > 3 {
        eprintln!("Usage: {} [address] [database_url]", args[0]);
        eprintln!("Without an address, lists every mailbox.");
        std::process::exit(1);
    }

    let database_url = args.get(2).map(String::as_str).unwrap_or("sqlite://labeld.db");
    let pool = SqlitePoolOptions::new()
        .connect(database_url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to database: {}", e))?;

    let rows = match args.get(1) {
        Some(address) => {
            sqlx::query("SELECT * FROM mailboxes WHERE address = ?")
                .bind(address)
                .fetch_all(&pool)
                .await?
        }
        None => {
            sqlx::query("SELECT * FROM mailboxes ORDER BY address")
                .fetch_all(&pool)
                .await?
        }
    };

    if rows.is_empty() {
        println!("No mailboxes found");
        return Ok(());
    }

    for row in rows {
        let address: String = row.get("address");
        let credential: Option<String> = row.get("credential_token");
        let scan_all_mail: bool = row.get("scan_all_mail");
        let starred: Option<String> = row.get("starred_label_id");
        let contact: Option<String> = row.get("contact_label_id");
        let version: i64 = row.get("version");

        println!("Mailbox: {}", address);
        println!("  credential:          {}", if credential.is_some() { "stored" } else { "none" });
        println!("  scan all mail:       {}", scan_all_mail);
        println!("  starred label:       {}", starred.as_deref().unwrap_or("-"));
        println!("  contact label:       {}", contact.as_deref().unwrap_or("-"));
        for column in [
            "last_thread_time",
            "no_runs_before",
            "last_run",
            "subscription_expiry",
            "lease_expiry",
        ] {
            let value: Option<i64> = row.get(column);
            println!("  {:<20} {}", format!("{}:", column.replace('_', " ")), show_time(value));
        }
        println!("  version:             {}", version);
        println!(
            "--------------------------------------------------------------------------------"
        );
    }

    Ok(())
}
