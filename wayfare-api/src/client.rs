use crate::item::ItemRef;
use crate::protocol::{expect_bool, expect_int, expect_text, usage, Request, COMMANDS};
use crate::remote::Channel;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use wayfare_core::{CoreError, CoreResult};

const PROMPT: &str = "\n>] ";

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Lost connection to the coordinator: {0}")]
    Connection(CoreError),
}

/// Interactive loop: reads commands from `input`, sends them to the
/// coordinator and prints a human readable answer to `output`.
///
/// Returns on `quit` or end of input. Refusals and transaction errors are
/// printed and the loop goes on; a broken connection ends the session.
pub async fn run<R, W>(channel: &mut Channel, input: R, mut output: W) -> Result<(), ClientError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    output
        .write_all(b"Connected. Type \"help\" for the list of supported commands\n")
        .await?;
    let mut lines = input.lines();

    loop {
        output.write_all(PROMPT.as_bytes()).await?;
        output.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (head, rest) = match line.split_once(',') {
            Some((head, rest)) => (head.trim(), Some(rest.trim())),
            None => (line, None),
        };
        if head.eq_ignore_ascii_case("quit") {
            output.write_all(b"Quitting client\n").await?;
            break;
        }
        if head.eq_ignore_ascii_case("help") {
            output.write_all(help(rest).as_bytes()).await?;
            continue;
        }

        let request = match Request::parse(line) {
            Ok(request) => request,
            Err(e) => {
                let hint = usage(head).map(|u| format!("\nUsage: {}", u)).unwrap_or_default();
                output.write_all(format!("{}{}\n", e, hint).as_bytes()).await?;
                continue;
            }
        };

        let message = match channel.call(&request).await {
            Ok(value) => describe(&request, value).unwrap_or_else(|e| e.to_string()),
            Err(e @ CoreError::Unavailable(_)) => return Err(ClientError::Connection(e)),
            Err(e) => e.to_string(),
        };
        output.write_all(message.as_bytes()).await?;
        output.write_all(b"\n").await?;
    }

    output.flush().await?;
    Ok(())
}

fn help(command: Option<&str>) -> String {
    match command {
        None | Some("") => {
            let mut text = String::from("Supported commands (txn -1 runs outside any transaction):\n");
            for (_, layout) in COMMANDS {
                text.push('\t');
                text.push_str(layout);
                text.push('\n');
            }
            text.push_str("\thelp,<command>\n\tquit\n");
            text
        }
        Some(command) => match usage(command) {
            Some(layout) => format!("Usage: {}\n", layout),
            None => format!("Unknown command '{}'\n", command),
        },
    }
}

fn noun(item: &ItemRef) -> &'static str {
    match item {
        ItemRef::Flight(_) => "Flight",
        ItemRef::Car(_) => "Cars",
        ItemRef::Room(_) => "Rooms",
    }
}

fn outcome(done: bool, what: &str, verb: &str) -> String {
    if done {
        format!("{} {}", what, verb)
    } else {
        format!("{} could not be {}", what, verb)
    }
}

/// Human readable rendering of a successful response.
fn describe(request: &Request, value: Option<String>) -> CoreResult<String> {
    let message = match request {
        Request::Start => format!("Transaction id: {}", expect_int(value)?),
        Request::Commit(txn) => outcome(expect_bool(value)?, &format!("Transaction {}", txn), "committed"),
        Request::Abort(txn) => format!("Transaction {} aborted", txn),
        Request::Prepare(txn) => format!("Vote on transaction {}: {}", txn, expect_bool(value)?),
        Request::Shutdown => {
            if expect_bool(value)? {
                "Shutting down the system".to_string()
            } else {
                "Shutdown refused: transactions are still live".to_string()
            }
        }
        Request::Ping => "Pong".to_string(),
        Request::Add { item, .. } => outcome(expect_bool(value)?, noun(item), "added"),
        Request::NewCustomer(_) => format!("New customer id: {}", expect_int(value)?),
        Request::NewCustomerId { customer, .. } => {
            outcome(expect_bool(value)?, &format!("Customer {}", customer), "created")
        }
        Request::Delete { item, .. } => outcome(expect_bool(value)?, noun(item), "deleted"),
        Request::DeleteCustomer { customer, .. } => {
            outcome(expect_bool(value)?, &format!("Customer {}", customer), "deleted")
        }
        Request::Query { item, .. } => {
            let count = expect_int(value)?;
            match item {
                ItemRef::Flight(num) => format!("Number of seats available on flight {}: {}", num, count),
                ItemRef::Car(location) => format!("Number of cars at {}: {}", location, count),
                ItemRef::Room(location) => format!("Number of rooms at {}: {}", location, count),
            }
        }
        Request::QueryPrice { item, .. } => format!("Price of {} {}: {}", noun(item).to_lowercase(), item.field(), expect_int(value)?),
        Request::QueryCustomerInfo { customer, .. } => {
            let info = expect_text(value)?;
            if info.is_empty() {
                format!("Customer {} not found", customer)
            } else {
                format!("Customer info:{}", info)
            }
        }
        Request::Reserve { item, .. } => outcome(expect_bool(value)?, noun(item), "reserved"),
        Request::Itinerary { .. } => outcome(expect_bool(value)?, "Itinerary", "reserved"),
    };
    Ok(message)
}
