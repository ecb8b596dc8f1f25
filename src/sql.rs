use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::{NewAppointment, ProviderProfile};
use crate::model::*;

/// Parsed command from SQL input.
///
/// Writes are INSERTs into entity tables (`businesses`, `providers`, ...) or
/// into action tables (`starts`, `ends`, `cancellations`, `shifts`, ...).
/// Reads are SELECTs over entity tables or virtual tables (`availability`,
/// `slot_check`, `next_slot`, `reassignments`, `health`).
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertBusiness(Business),
    InsertProvider(ProviderProfile),
    DeleteProvider {
        id: Ulid,
    },
    InsertWorkingHours {
        provider_id: Ulid,
        hours: WorkingHours,
    },
    InsertBreak {
        provider_id: Ulid,
        brk: Break,
    },
    DeleteBreak {
        id: Ulid,
    },
    InsertSkill {
        provider_id: Ulid,
        skill: Skill,
    },
    DeleteSkill {
        provider_id: Ulid,
        code: String,
    },
    InsertClient(Client),
    InsertAppointment(NewAppointment),
    StartAppointment {
        id: Ulid,
    },
    EndAppointment {
        id: Ulid,
    },
    CloseAppointment {
        id: Ulid,
        reason: CloseReason,
    },
    ShiftAppointment {
        id: Ulid,
        provider_id: Ulid,
    },
    SetPresence {
        provider_id: Ulid,
        online: bool,
    },
    InsertTransfer {
        id: Ulid,
        appointment_id: Ulid,
        receiver_id: Ulid,
    },
    ResolveTransfer {
        id: Ulid,
        accept: bool,
    },
    /// Apply the rebalancer's proposals, all of them or just one appointment's.
    ApplyReassignments {
        business_id: Ulid,
        appointment_id: Option<Ulid>,
    },
    /// Take or renew the autopilot lease of a business for `holder`.
    AcquireLease {
        business_id: Ulid,
        holder: String,
    },
    SelectBusinesses,
    SelectProviders {
        business_id: Ulid,
    },
    SelectAppointments {
        provider_id: Option<Ulid>,
        business_id: Option<Ulid>,
        day: Option<Ms>,
    },
    SelectTransfers {
        appointment_id: Ulid,
    },
    SelectAvailability {
        provider_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SelectSlotCheck {
        provider_id: Ulid,
        start: Ms,
        duration_minutes: u32,
    },
    /// One row per provider; `provider_id IN (...)` batches the search.
    SelectNextSlot {
        provider_ids: Vec<Ulid>,
        after: Ms,
        duration_minutes: u32,
        days: Option<u32>,
    },
    SelectReassignments {
        business_id: Ulid,
    },
    SelectHealth {
        business_id: Ulid,
    },
    SelectLease {
        business_id: Ulid,
    },
    Listen {
        channel: String,
    },
    /// `None` means `UNLISTEN *`.
    Unlisten {
        channel: Option<String>,
    },
}

/// Parse exactly one statement. Used for prepared statements, which carry a
/// single command.
pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let mut commands = parse_batch(sql)?;
    if commands.len() > 1 {
        return Err(SqlError::MultipleStatements(commands.len()));
    }
    commands.pop().ok_or(SqlError::Empty)
}

/// Parse a simple-query string into one command per statement, in order.
/// LISTEN and UNLISTEN must be sent on their own.
pub fn parse_batch(sql: &str) -> Result<Vec<Command>, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    let upper = trimmed.to_uppercase();
    if upper.starts_with("LISTEN ") {
        let channel = unquote(trimmed[7..].trim());
        return Ok(vec![Command::Listen { channel }]);
    }
    if upper.starts_with("UNLISTEN ") {
        let channel = unquote(trimmed[9..].trim());
        let channel = (channel != "*").then_some(channel);
        return Ok(vec![Command::Unlisten { channel }]);
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    stmts.iter().map(parse_statement).collect()
}

fn parse_statement(stmt: &Statement) -> Result<Command, SqlError> {
    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn unquote(s: &str) -> String {
    s.trim_matches('"').to_string()
}

/// Positional VALUES with trailing columns optional.
struct Row<'a> {
    table: &'static str,
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn new(table: &'static str, values: &'a [Expr], required: usize) -> Result<Self, SqlError> {
        if values.len() < required {
            return Err(SqlError::WrongArity(table, required, values.len()));
        }
        Ok(Self { table, values })
    }

    fn at(&self, i: usize) -> Result<&'a Expr, SqlError> {
        self.values
            .get(i)
            .ok_or(SqlError::WrongArity(self.table, i + 1, self.values.len()))
    }

    /// Value at `i` unless the column was omitted or NULL.
    fn opt(&self, i: usize) -> Option<&'a Expr> {
        self.values.get(i).filter(|e| !is_null(e))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "businesses" => {
            let row = Row::new("businesses", &values, 2)?;
            let mut business = Business::new(
                parse_ulid(row.at(0)?)?,
                parse_string(row.at(1)?)?,
                row.opt(2).map(parse_i32).transpose()?.unwrap_or(0),
            );
            if let Some(e) = row.opt(3) {
                business.admin_contacts = split_list(&parse_string(e)?);
            }
            if let Some(e) = row.opt(4) {
                let mode = parse_string(e)?;
                business.rebalance_mode =
                    RebalanceMode::parse(&mode).ok_or_else(|| SqlError::Parse(format!("bad rebalance mode: {mode}")))?;
            }
            if let Some(e) = row.opt(5) {
                business.warning_pct = parse_u32(e)?;
            }
            if let Some(e) = row.opt(6) {
                business.critical_pct = parse_u32(e)?;
            }
            Ok(Command::InsertBusiness(business))
        }
        "providers" => {
            let row = Row::new("providers", &values, 3)?;
            Ok(Command::InsertProvider(ProviderProfile {
                id: parse_ulid(row.at(0)?)?,
                business_id: parse_ulid(row.at(1)?)?,
                name: parse_string(row.at(2)?)?,
                contact: row.opt(3).map(parse_string).transpose()?,
                buffer_minutes: row.opt(4).map(parse_u16).transpose()?.unwrap_or(0),
            }))
        }
        "working_hours" => {
            let row = Row::new("working_hours", &values, 4)?;
            Ok(Command::InsertWorkingHours {
                provider_id: parse_ulid(row.at(0)?)?,
                hours: WorkingHours {
                    weekday: parse_u8(row.at(1)?)?,
                    start_minute: parse_u16(row.at(2)?)?,
                    end_minute: parse_u16(row.at(3)?)?,
                    active: row.opt(4).map(parse_bool).transpose()?.unwrap_or(true),
                },
            })
        }
        "breaks" => {
            let row = Row::new("breaks", &values, 5)?;
            Ok(Command::InsertBreak {
                provider_id: parse_ulid(row.at(1)?)?,
                brk: Break {
                    id: parse_ulid(row.at(0)?)?,
                    weekday: parse_u8(row.at(2)?)?,
                    start_minute: parse_u16(row.at(3)?)?,
                    duration_minutes: parse_u16(row.at(4)?)?,
                    label: row.opt(5).map(parse_string).transpose()?,
                },
            })
        }
        "skills" => {
            let row = Row::new("skills", &values, 2)?;
            Ok(Command::InsertSkill {
                provider_id: parse_ulid(row.at(0)?)?,
                skill: Skill {
                    code: parse_string(row.at(1)?)?,
                    duration_minutes: row.opt(2).map(parse_u32).transpose()?,
                    price_cents: row.opt(3).map(parse_u64).transpose()?,
                },
            })
        }
        "clients" => {
            let row = Row::new("clients", &values, 3)?;
            Ok(Command::InsertClient(Client {
                id: parse_ulid(row.at(0)?)?,
                business_id: parse_ulid(row.at(1)?)?,
                name: parse_string(row.at(2)?)?,
                contact: row.opt(3).map(parse_string).transpose()?,
                opted_in: row.opt(4).map(parse_bool).transpose()?.unwrap_or(false),
            }))
        }
        "appointments" => {
            let row = Row::new("appointments", &values, 4)?;
            Ok(Command::InsertAppointment(NewAppointment {
                id: parse_ulid(row.at(0)?)?,
                client_id: parse_ulid(row.at(1)?)?,
                provider_id: parse_ulid(row.at(2)?)?,
                scheduled_start: parse_i64(row.at(3)?)?,
                duration_minutes: row.opt(4).map(parse_u32).transpose()?,
                treatment: row.opt(5).map(parse_string).transpose()?,
                required_skills: row
                    .opt(6)
                    .map(|e| parse_string(e).map(|s| split_list(&s)))
                    .transpose()?
                    .unwrap_or_default(),
            }))
        }
        "starts" => {
            let row = Row::new("starts", &values, 1)?;
            Ok(Command::StartAppointment { id: parse_ulid(row.at(0)?)? })
        }
        "ends" => {
            let row = Row::new("ends", &values, 1)?;
            Ok(Command::EndAppointment { id: parse_ulid(row.at(0)?)? })
        }
        "cancellations" => {
            let row = Row::new("cancellations", &values, 1)?;
            let reason = match row.opt(1) {
                None => CloseReason::Cancelled,
                Some(e) => {
                    let s = parse_string(e)?;
                    CloseReason::parse(&s).ok_or_else(|| SqlError::Parse(format!("bad close reason: {s}")))?
                }
            };
            Ok(Command::CloseAppointment { id: parse_ulid(row.at(0)?)?, reason })
        }
        "shifts" => {
            let row = Row::new("shifts", &values, 2)?;
            Ok(Command::ShiftAppointment {
                id: parse_ulid(row.at(0)?)?,
                provider_id: parse_ulid(row.at(1)?)?,
            })
        }
        "presence" => {
            let row = Row::new("presence", &values, 2)?;
            Ok(Command::SetPresence {
                provider_id: parse_ulid(row.at(0)?)?,
                online: parse_bool(row.at(1)?)?,
            })
        }
        "transfers" => {
            let row = Row::new("transfers", &values, 3)?;
            Ok(Command::InsertTransfer {
                id: parse_ulid(row.at(0)?)?,
                appointment_id: parse_ulid(row.at(1)?)?,
                receiver_id: parse_ulid(row.at(2)?)?,
            })
        }
        "transfer_decisions" => {
            let row = Row::new("transfer_decisions", &values, 2)?;
            Ok(Command::ResolveTransfer {
                id: parse_ulid(row.at(0)?)?,
                accept: parse_bool(row.at(1)?)?,
            })
        }
        "reassignment_applications" => {
            let row = Row::new("reassignment_applications", &values, 1)?;
            Ok(Command::ApplyReassignments {
                business_id: parse_ulid(row.at(0)?)?,
                appointment_id: row.opt(1).map(parse_ulid).transpose()?,
            })
        }
        "leases" => {
            let row = Row::new("leases", &values, 2)?;
            Ok(Command::AcquireLease {
                business_id: parse_ulid(row.at(0)?)?,
                holder: parse_string(row.at(1)?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::collect(delete.selection.as_ref());

    match table.as_str() {
        "providers" => Ok(Command::DeleteProvider { id: filters.ulid("id")? }),
        "breaks" => Ok(Command::DeleteBreak { id: filters.ulid("id")? }),
        "skills" => Ok(Command::DeleteSkill {
            provider_id: filters.ulid("provider_id")?,
            code: parse_string(filters.require("code")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let filters = Filters::collect(select.selection.as_ref());

    match table.as_str() {
        "businesses" => Ok(Command::SelectBusinesses),
        "providers" => Ok(Command::SelectProviders { business_id: filters.ulid("business_id")? }),
        "appointments" => {
            let provider_id = filters.opt_ulid("provider_id")?;
            let business_id = filters.opt_ulid("business_id")?;
            if provider_id.is_none() && business_id.is_none() {
                return Err(SqlError::MissingFilter("provider_id or business_id"));
            }
            let day = filters.get("day").map(parse_i64).transpose()?;
            if business_id.is_some() && provider_id.is_none() && day.is_none() {
                return Err(SqlError::MissingFilter("day"));
            }
            Ok(Command::SelectAppointments { provider_id, business_id, day })
        }
        "transfers" => Ok(Command::SelectTransfers { appointment_id: filters.ulid("appointment_id")? }),
        "availability" => Ok(Command::SelectAvailability {
            provider_id: filters.ulid("provider_id")?,
            start: parse_i64(filters.require("start")?)?,
            end: parse_i64(filters.require("end")?)?,
        }),
        "slot_check" => Ok(Command::SelectSlotCheck {
            provider_id: filters.ulid("provider_id")?,
            start: parse_i64(filters.require("start")?)?,
            duration_minutes: parse_u32(filters.require("duration_minutes")?)?,
        }),
        "next_slot" => {
            let provider_ids = match filters.list("provider_id") {
                Some(list) => list.iter().map(parse_ulid).collect::<Result<Vec<_>, _>>()?,
                None => vec![filters.ulid("provider_id")?],
            };
            Ok(Command::SelectNextSlot {
                provider_ids,
                after: parse_i64(filters.require("start")?)?,
                duration_minutes: parse_u32(filters.require("duration_minutes")?)?,
                days: filters.get("days").map(parse_u32).transpose()?,
            })
        }
        "reassignments" => Ok(Command::SelectReassignments { business_id: filters.ulid("business_id")? }),
        "health" => Ok(Command::SelectHealth { business_id: filters.ulid("business_id")? }),
        "leases" => Ok(Command::SelectLease { business_id: filters.ulid("business_id")? }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE filters ─────────────────────────────────────────────

/// Column comparisons from an AND-chain. The comparison operator is not
/// checked; `start >= x` and `start = x` both bind `start`.
#[derive(Default)]
struct Filters<'a> {
    values: Vec<(String, &'a Expr)>,
    lists: Vec<(String, &'a [Expr])>,
}

impl<'a> Filters<'a> {
    fn collect(selection: Option<&'a Expr>) -> Self {
        let mut filters = Self::default();
        if let Some(expr) = selection {
            filters.walk(expr);
        }
        filters
    }

    fn walk(&mut self, expr: &'a Expr) {
        match expr {
            Expr::BinaryOp { left, op, right } => match op {
                ast::BinaryOperator::And => {
                    self.walk(left);
                    self.walk(right);
                }
                ast::BinaryOperator::Eq
                | ast::BinaryOperator::GtEq
                | ast::BinaryOperator::LtEq
                | ast::BinaryOperator::Gt
                | ast::BinaryOperator::Lt => {
                    if let Some(col) = expr_column_name(left) {
                        self.values.push((col, &**right));
                    }
                }
                _ => {}
            },
            Expr::InList { expr, list, negated: false } => {
                if let Some(col) = expr_column_name(expr) {
                    self.lists.push((col, list.as_slice()));
                }
            }
            Expr::Nested(inner) => self.walk(inner),
            _ => {}
        }
    }

    fn get(&self, col: &str) -> Option<&'a Expr> {
        self.values.iter().find(|(c, _)| c == col).map(|(_, e)| *e)
    }

    fn require(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingFilter(col))
    }

    fn list(&self, col: &str) -> Option<&'a [Expr]> {
        self.lists.iter().find(|(c, _)| c == col).map(|(_, l)| *l)
    }

    fn ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid(self.require(col)?)
    }

    fn opt_ulid(&self, col: &str) -> Result<Option<Ulid>, SqlError> {
        self.get(col).map(parse_ulid).transpose()
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row VALUES".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

/// Comma-separated text column into trimmed, non-empty items.
fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(String::from)
        .collect()
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i32(expr: &Expr) -> Result<i32, SqlError> {
    let v = parse_i64(expr)?;
    i32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of i32 range")))
}

fn parse_u8(expr: &Expr) -> Result<u8, SqlError> {
    let v = parse_i64(expr)?;
    u8::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u8 range")))
}

fn parse_u16(expr: &Expr) -> Result<u16, SqlError> {
    let v = parse_i64(expr)?;
    u16::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u16 range")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_u64(expr: &Expr) -> Result<u64, SqlError> {
    let v = parse_i64(expr)?;
    u64::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u64 range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    MultipleStatements(usize),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::MultipleStatements(n) => {
                write!(f, "prepared statement holds {n} statements, expected one")
            }
        }
    }
}

impl std::error::Error for SqlError {}
