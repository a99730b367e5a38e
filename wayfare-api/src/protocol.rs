//! Line protocol shared by the client, the coordinator and the resource managers.
//!
//! A request is one line of comma-separated fields, the first being the
//! operation name (matched case-insensitively). A response is one line:
//! `OK`, `OK,<value>` or `ERR,<kind>,<txn>,<message>`. Newlines inside a
//! value travel as `@`.

use crate::item::ItemRef;
use wayfare_core::{CoreError, CoreResult};
use wayfare_shared::{CustomerId, TxnId};

const NEWLINE_MARK: char = '@';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Start,
    Commit(TxnId),
    Abort(TxnId),
    Prepare(TxnId),
    Shutdown,
    Ping,
    Add { txn: TxnId, item: ItemRef, count: i64, price: i64 },
    NewCustomer(TxnId),
    NewCustomerId { txn: TxnId, customer: CustomerId },
    Delete { txn: TxnId, item: ItemRef },
    DeleteCustomer { txn: TxnId, customer: CustomerId },
    Query { txn: TxnId, item: ItemRef },
    QueryPrice { txn: TxnId, item: ItemRef },
    QueryCustomerInfo { txn: TxnId, customer: CustomerId },
    Reserve { txn: TxnId, customer: CustomerId, item: ItemRef },
    Itinerary {
        txn: TxnId,
        customer: CustomerId,
        flights: Vec<i64>,
        location: String,
        car: bool,
        room: bool,
    },
}

/// Operation names with their argument layout, used for `help`.
pub const COMMANDS: &[(&str, &str)] = &[
    ("start", "start"),
    ("commit", "commit,<txn>"),
    ("abort", "abort,<txn>"),
    ("shutdown", "shutdown"),
    ("ping", "ping"),
    ("addFlight", "addFlight,<txn>,<flight number>,<seats>,<price>"),
    ("addCars", "addCars,<txn>,<location>,<count>,<price>"),
    ("addRooms", "addRooms,<txn>,<location>,<count>,<price>"),
    ("newCustomer", "newCustomer,<txn>"),
    ("newCustomerId", "newCustomerId,<txn>,<customer id>"),
    ("deleteFlight", "deleteFlight,<txn>,<flight number>"),
    ("deleteCars", "deleteCars,<txn>,<location>"),
    ("deleteRooms", "deleteRooms,<txn>,<location>"),
    ("deleteCustomer", "deleteCustomer,<txn>,<customer id>"),
    ("queryFlight", "queryFlight,<txn>,<flight number>"),
    ("queryCars", "queryCars,<txn>,<location>"),
    ("queryRooms", "queryRooms,<txn>,<location>"),
    ("queryFlightPrice", "queryFlightPrice,<txn>,<flight number>"),
    ("queryCarsPrice", "queryCarsPrice,<txn>,<location>"),
    ("queryRoomsPrice", "queryRoomsPrice,<txn>,<location>"),
    ("queryCustomerInfo", "queryCustomerInfo,<txn>,<customer id>"),
    ("reserveFlight", "reserveFlight,<txn>,<customer id>,<flight number>"),
    ("reserveCar", "reserveCar,<txn>,<customer id>,<location>"),
    ("reserveRoom", "reserveRoom,<txn>,<customer id>,<location>"),
    (
        "itinerary",
        "itinerary,<txn>,<customer id>,<flight 1>,...,<flight n>,<location>,<car y/n>,<room y/n>",
    ),
];

/// Argument layout for one command, if it exists.
pub fn usage(command: &str) -> Option<&'static str> {
    let command = command.trim();
    COMMANDS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(command))
        .map(|(_, usage)| *usage)
}

struct Args<'a> {
    op: &'a str,
    fields: &'a [&'a str],
}

impl<'a> Args<'a> {
    fn arity(&self, expected: usize) -> CoreResult<()> {
        if self.fields.len() == expected {
            Ok(())
        } else {
            Err(CoreError::Protocol(format!(
                "{} takes {} argument(s), got {}",
                self.op,
                expected,
                self.fields.len()
            )))
        }
    }

    fn int(&self, at: usize, what: &str) -> CoreResult<i64> {
        let raw = self.fields.get(at).copied().unwrap_or_default();
        raw.parse()
            .map_err(|_| CoreError::Protocol(format!("{}: {} must be an integer, got '{}'", self.op, what, raw)))
    }

    fn txn(&self, at: usize) -> CoreResult<TxnId> {
        self.int(at, "transaction id").map(TxnId)
    }

    fn text(&self, at: usize, what: &str) -> CoreResult<String> {
        match self.fields.get(at) {
            Some(value) if !value.is_empty() => Ok(value.to_string()),
            _ => Err(CoreError::Protocol(format!("{}: {} is empty", self.op, what))),
        }
    }

    fn flag(&self, at: usize, what: &str) -> CoreResult<bool> {
        let raw = self.fields.get(at).copied().unwrap_or_default();
        parse_flag(raw).ok_or_else(|| CoreError::Protocol(format!("{}: {} must be true or false, got '{}'", self.op, what, raw)))
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "1" => Some(true),
        "false" | "f" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

impl Request {
    /// Parses one command line.
    pub fn parse(line: &str) -> CoreResult<Request> {
        let fields: Vec<&str> = line.trim().split(',').map(str::trim).collect();
        let (op, rest) = match fields.split_first() {
            Some((op, rest)) if !op.is_empty() => (*op, rest),
            _ => return Err(CoreError::Protocol("empty command".into())),
        };
        let a = Args { op, fields: rest };
        let lower = op.to_ascii_lowercase();

        let request = match lower.as_str() {
            "start" => {
                a.arity(0)?;
                Request::Start
            }
            "commit" => {
                a.arity(1)?;
                Request::Commit(a.txn(0)?)
            }
            "abort" => {
                a.arity(1)?;
                Request::Abort(a.txn(0)?)
            }
            "prepare" => {
                a.arity(1)?;
                Request::Prepare(a.txn(0)?)
            }
            "shutdown" => {
                a.arity(0)?;
                Request::Shutdown
            }
            "ping" => {
                a.arity(0)?;
                Request::Ping
            }
            "addflight" => {
                a.arity(4)?;
                Request::Add {
                    txn: a.txn(0)?,
                    item: ItemRef::Flight(a.int(1, "flight number")?),
                    count: a.int(2, "seats")?,
                    price: a.int(3, "price")?,
                }
            }
            "addcars" | "addrooms" => {
                a.arity(4)?;
                let location = a.text(1, "location")?;
                Request::Add {
                    txn: a.txn(0)?,
                    item: if lower == "addcars" {
                        ItemRef::Car(location)
                    } else {
                        ItemRef::Room(location)
                    },
                    count: a.int(2, "count")?,
                    price: a.int(3, "price")?,
                }
            }
            "newcustomer" if rest.len() == 2 => Request::NewCustomerId {
                txn: a.txn(0)?,
                customer: a.int(1, "customer id")?,
            },
            "newcustomer" => {
                a.arity(1)?;
                Request::NewCustomer(a.txn(0)?)
            }
            "newcustomerid" => {
                a.arity(2)?;
                Request::NewCustomerId {
                    txn: a.txn(0)?,
                    customer: a.int(1, "customer id")?,
                }
            }
            "deletecustomer" => {
                a.arity(2)?;
                Request::DeleteCustomer {
                    txn: a.txn(0)?,
                    customer: a.int(1, "customer id")?,
                }
            }
            "querycustomerinfo" => {
                a.arity(2)?;
                Request::QueryCustomerInfo {
                    txn: a.txn(0)?,
                    customer: a.int(1, "customer id")?,
                }
            }
            "deleteflight" | "deletecars" | "deleterooms" => {
                a.arity(2)?;
                Request::Delete {
                    txn: a.txn(0)?,
                    item: item_arg(&a, 1, &lower[6..])?,
                }
            }
            "queryflight" | "querycars" | "queryrooms" => {
                a.arity(2)?;
                Request::Query {
                    txn: a.txn(0)?,
                    item: item_arg(&a, 1, &lower[5..])?,
                }
            }
            "queryflightprice" | "querycarsprice" | "queryroomsprice" => {
                a.arity(2)?;
                Request::QueryPrice {
                    txn: a.txn(0)?,
                    item: item_arg(&a, 1, &lower[5..lower.len() - 5])?,
                }
            }
            "reserveflight" | "reservecar" | "reserveroom" => {
                a.arity(3)?;
                Request::Reserve {
                    txn: a.txn(0)?,
                    customer: a.int(1, "customer id")?,
                    item: item_arg(&a, 2, &lower[7..])?,
                }
            }
            "itinerary" => {
                if rest.len() < 5 {
                    return Err(CoreError::Protocol(format!(
                        "itinerary takes at least 5 arguments, got {}",
                        rest.len()
                    )));
                }
                let tail = rest.len() - 3;
                let flights = (2..tail)
                    .map(|at| a.int(at, "flight number"))
                    .collect::<CoreResult<Vec<i64>>>()?;
                Request::Itinerary {
                    txn: a.txn(0)?,
                    customer: a.int(1, "customer id")?,
                    flights,
                    location: a.text(tail, "location")?,
                    car: a.flag(tail + 1, "car")?,
                    room: a.flag(tail + 2, "room")?,
                }
            }
            _ => return Err(CoreError::Protocol(format!("unknown command '{}'", op))),
        };
        Ok(request)
    }

    /// Canonical operation name.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Start => "start",
            Request::Commit(_) => "commit",
            Request::Abort(_) => "abort",
            Request::Prepare(_) => "prepare",
            Request::Shutdown => "shutdown",
            Request::Ping => "ping",
            Request::Add { item, .. } => match item {
                ItemRef::Flight(_) => "addFlight",
                ItemRef::Car(_) => "addCars",
                ItemRef::Room(_) => "addRooms",
            },
            Request::NewCustomer(_) => "newCustomer",
            Request::NewCustomerId { .. } => "newCustomerId",
            Request::Delete { item, .. } => match item {
                ItemRef::Flight(_) => "deleteFlight",
                ItemRef::Car(_) => "deleteCars",
                ItemRef::Room(_) => "deleteRooms",
            },
            Request::DeleteCustomer { .. } => "deleteCustomer",
            Request::Query { item, .. } => match item {
                ItemRef::Flight(_) => "queryFlight",
                ItemRef::Car(_) => "queryCars",
                ItemRef::Room(_) => "queryRooms",
            },
            Request::QueryPrice { item, .. } => match item {
                ItemRef::Flight(_) => "queryFlightPrice",
                ItemRef::Car(_) => "queryCarsPrice",
                ItemRef::Room(_) => "queryRoomsPrice",
            },
            Request::QueryCustomerInfo { .. } => "queryCustomerInfo",
            Request::Reserve { item, .. } => match item {
                ItemRef::Flight(_) => "reserveFlight",
                ItemRef::Car(_) => "reserveCar",
                ItemRef::Room(_) => "reserveRoom",
            },
            Request::Itinerary { .. } => "itinerary",
        }
    }

    /// The transaction the request runs under, if it names one.
    pub fn txn(&self) -> Option<TxnId> {
        match self {
            Request::Start | Request::Shutdown | Request::Ping => None,
            Request::Commit(txn) | Request::Abort(txn) | Request::Prepare(txn) | Request::NewCustomer(txn) => Some(*txn),
            Request::Add { txn, .. }
            | Request::NewCustomerId { txn, .. }
            | Request::Delete { txn, .. }
            | Request::DeleteCustomer { txn, .. }
            | Request::Query { txn, .. }
            | Request::QueryPrice { txn, .. }
            | Request::QueryCustomerInfo { txn, .. }
            | Request::Reserve { txn, .. }
            | Request::Itinerary { txn, .. } => Some(*txn),
        }
    }

    /// Renders the request as a command line, without the trailing newline.
    pub fn encode(&self) -> String {
        let mut fields = vec![self.name().to_string()];
        match self {
            Request::Start | Request::Shutdown | Request::Ping => {}
            Request::Commit(txn) | Request::Abort(txn) | Request::Prepare(txn) | Request::NewCustomer(txn) => {
                fields.push(txn.to_string())
            }
            Request::Add { txn, item, count, price } => {
                fields.extend([txn.to_string(), item.field(), count.to_string(), price.to_string()])
            }
            Request::NewCustomerId { txn, customer }
            | Request::DeleteCustomer { txn, customer }
            | Request::QueryCustomerInfo { txn, customer } => fields.extend([txn.to_string(), customer.to_string()]),
            Request::Delete { txn, item } | Request::Query { txn, item } | Request::QueryPrice { txn, item } => {
                fields.extend([txn.to_string(), item.field()])
            }
            Request::Reserve { txn, customer, item } => {
                fields.extend([txn.to_string(), customer.to_string(), item.field()])
            }
            Request::Itinerary {
                txn,
                customer,
                flights,
                location,
                car,
                room,
            } => {
                fields.extend([txn.to_string(), customer.to_string()]);
                fields.extend(flights.iter().map(i64::to_string));
                fields.extend([location.clone(), car.to_string(), room.to_string()]);
            }
        }
        fields.join(",")
    }
}

fn item_arg(a: &Args<'_>, at: usize, category: &str) -> CoreResult<ItemRef> {
    match category {
        "flight" => Ok(ItemRef::Flight(a.int(at, "flight number")?)),
        "car" | "cars" => Ok(ItemRef::Car(a.text(at, "location")?)),
        _ => Ok(ItemRef::Room(a.text(at, "location")?)),
    }
}

/// Successful result of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Unit,
    Bool(bool),
    Int(i64),
    Text(String),
}

/// Renders a result as a response line, without the trailing newline.
pub fn encode_response(result: &CoreResult<Reply>) -> String {
    match result {
        Ok(Reply::Unit) => "OK".to_string(),
        Ok(Reply::Bool(value)) => format!("OK,{}", value),
        Ok(Reply::Int(value)) => format!("OK,{}", value),
        Ok(Reply::Text(text)) => format!("OK,{}", text.replace('\n', &NEWLINE_MARK.to_string())),
        Err(e) => {
            let (txn, message) = match e {
                CoreError::InvalidTransaction(txn, message) | CoreError::TransactionAborted(txn, message) => {
                    (*txn, message.clone())
                }
                CoreError::TransactionTimedOut(txn) => (*txn, String::new()),
                CoreError::Unavailable(message)
                | CoreError::Protocol(message)
                | CoreError::Journal(message)
                | CoreError::Internal(message) => (TxnId::GLOBAL, message.clone()),
            };
            format!("ERR,{},{},{}", e.kind(), txn, message.replace('\n', " "))
        }
    }
}

/// Parses a response line. `Ok(None)` is a bare `OK`, `Ok(Some(_))` carries the
/// value with newlines restored.
pub fn decode_response(line: &str) -> CoreResult<Option<String>> {
    let line = line.trim_end_matches(&['\r', '\n'][..]);
    if line == "OK" {
        return Ok(None);
    }
    if let Some(value) = line.strip_prefix("OK,") {
        return Ok(Some(value.replace(NEWLINE_MARK, "\n")));
    }
    if let Some(error) = line.strip_prefix("ERR,") {
        let mut parts = error.splitn(3, ',');
        let kind = parts.next().unwrap_or_default();
        let txn = parts
            .next()
            .and_then(|raw| raw.parse::<TxnId>().ok())
            .unwrap_or(TxnId::GLOBAL);
        let message = parts.next().unwrap_or_default().to_string();
        return Err(match kind {
            "invalid_transaction" => CoreError::InvalidTransaction(txn, message),
            "aborted" => CoreError::TransactionAborted(txn, message),
            "timeout" => CoreError::TransactionTimedOut(txn),
            "unavailable" => CoreError::Unavailable(message),
            "protocol" => CoreError::Protocol(message),
            "journal" => CoreError::Journal(message),
            _ => CoreError::Internal(message),
        });
    }
    Err(CoreError::Protocol(format!("malformed response '{}'", line)))
}

pub fn expect_bool(value: Option<String>) -> CoreResult<bool> {
    match value.as_deref() {
        Some("true") => Ok(true),
        Some("false") => Ok(false),
        other => Err(CoreError::Protocol(format!("expected a boolean, got {:?}", other))),
    }
}

pub fn expect_int(value: Option<String>) -> CoreResult<i64> {
    value
        .as_deref()
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| CoreError::Protocol(format!("expected an integer, got {:?}", value)))
}

pub fn expect_text(value: Option<String>) -> CoreResult<String> {
    // An empty string comes back as `OK,`
    value.ok_or_else(|| CoreError::Protocol("expected a value, got a bare OK".into()))
}
