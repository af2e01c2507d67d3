use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use sqlparser::ast::{
    self, Assignment, AssignmentTarget, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;
use crate::validation::FieldError;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertWedding {
        draft: WeddingDraft,
    },
    UpdateWedding {
        id: Ulid,
        changes: WeddingChanges,
    },
    DeleteWedding {
        id: Ulid,
    },
    SelectWeddings {
        id: Option<Ulid>,
        filter: WeddingFilter,
    },
    SelectConflicts {
        candidate: BookingInput,
        exclude: Option<Ulid>,
    },
    SelectProclamations {
        target: ProclamationTarget,
    },
    SelectCalendar {
        month: MonthKey,
    },
    SelectStatistics {
        month: MonthKey,
    },
    SelectReminders {
        /// Evaluate as of this moment instead of the server clock.
        at: Option<NaiveDateTime>,
    },
    InsertLocation {
        name: String,
        address: Option<String>,
        capacity: Option<u32>,
    },
    UpdateLocation {
        id: LocationId,
        changes: LocationChanges,
    },
    SelectLocations {
        is_active: Option<bool>,
    },
    InsertCelebrant {
        name: String,
        title: String,
        phone: Option<String>,
    },
    UpdateCelebrant {
        id: CelebrantId,
        changes: CelebrantChanges,
    },
    SelectCelebrants {
        is_active: Option<bool>,
    },
    SetConfig {
        entries: Vec<(String, String)>,
    },
    SelectConfig {
        key: Option<String>,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProclamationTarget {
    Date(NaiveDate),
    Wedding(Ulid),
}

/// Columns assigned by `UPDATE weddings`. `None` leaves a column unchanged;
/// nullable columns use a nested option so `NULL` can clear them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WeddingChanges {
    pub wedding_date: Option<NaiveDate>,
    pub wedding_time: Option<NaiveTime>,
    pub location_id: Option<LocationId>,
    pub celebrant_id: Option<CelebrantId>,
    pub is_community: Option<bool>,
    pub interview_at: Option<Option<NaiveDateTime>>,
    pub bride_name: Option<String>,
    pub bride_whatsapp: Option<String>,
    pub groom_name: Option<String>,
    pub groom_whatsapp: Option<String>,
    pub with_civil_effect: Option<bool>,
    pub transfer_type: Option<TransferType>,
    pub observations: Option<Option<String>>,
    pub status: Option<WeddingStatus>,
}

impl WeddingChanges {
    /// True when the statement only moves the booking through its lifecycle.
    pub fn is_status_only(&self) -> bool {
        self.status.is_some() && *self == WeddingChanges { status: self.status, ..Default::default() }
    }

    /// The booking's details with these changes applied.
    pub fn apply(&self, current: &Wedding) -> WeddingDraft {
        let slot = &current.slot;
        let couple = &current.couple;
        WeddingDraft {
            slot: BookingInput::new(
                self.wedding_date.unwrap_or(slot.wedding_date),
                self.wedding_time.unwrap_or(slot.wedding_time),
                self.location_id.unwrap_or(slot.location_id),
                self.celebrant_id.unwrap_or(slot.celebrant_id),
                self.is_community.unwrap_or(slot.is_community),
            ),
            interview_at: self.interview_at.unwrap_or(current.interview_at),
            couple: CoupleDetails {
                bride_name: self.bride_name.clone().unwrap_or_else(|| couple.bride_name.clone()),
                bride_whatsapp: self.bride_whatsapp.clone().unwrap_or_else(|| couple.bride_whatsapp.clone()),
                groom_name: self.groom_name.clone().unwrap_or_else(|| couple.groom_name.clone()),
                groom_whatsapp: self.groom_whatsapp.clone().unwrap_or_else(|| couple.groom_whatsapp.clone()),
            },
            with_civil_effect: self.with_civil_effect.unwrap_or(current.with_civil_effect),
            transfer_type: self.transfer_type.unwrap_or(current.transfer_type),
            observations: self.observations.clone().unwrap_or_else(|| current.observations.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocationChanges {
    pub name: Option<String>,
    pub address: Option<Option<String>>,
    pub capacity: Option<Option<u32>>,
    pub is_active: Option<bool>,
}

impl LocationChanges {
    pub fn touches_details(&self) -> bool {
        self.name.is_some() || self.address.is_some() || self.capacity.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CelebrantChanges {
    pub name: Option<String>,
    pub title: Option<String>,
    pub phone: Option<Option<String>>,
    pub is_active: Option<bool>,
}

impl CelebrantChanges {
    pub fn touches_details(&self) -> bool {
        self.name.is_some() || self.title.is_some() || self.phone.is_some()
    }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if let Some(channel) = strip_keyword(trimmed, "LISTEN ") {
        return Ok(Command::Listen { channel: unquote(channel) });
    }
    if let Some(channel) = strip_keyword(trimmed, "UNLISTEN ") {
        return Ok(match channel.trim() {
            "*" => Command::UnlistenAll,
            channel => Command::Unlisten { channel: unquote(channel) },
        });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection.as_ref()),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn strip_keyword<'a>(sql: &'a str, keyword: &str) -> Option<&'a str> {
    let head = sql.get(..keyword.len())?;
    head.eq_ignore_ascii_case(keyword).then(|| &sql[keyword.len()..])
}

fn unquote(raw: &str) -> String {
    raw.trim().trim_matches('"').to_string()
}

// ── INSERT ────────────────────────────────────────────────────

/// Column/value pairs of one VALUES row.
struct Row<'a> {
    table: &'static str,
    cells: Vec<(String, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn new(table: &'static str, cells: Vec<(String, &'a Expr)>, known: &[&str]) -> Result<Self, SqlError> {
        if let Some((col, _)) = cells.iter().find(|(c, _)| !known.contains(&c.as_str())) {
            return Err(SqlError::UnknownColumn(table, col.clone()));
        }
        Ok(Self { table, cells })
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.cells.iter().find(|(c, _)| c == column).map(|(_, e)| *e)
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(self.table, column))
    }
}

const WEDDING_COLUMNS: &[&str] = &[
    "wedding_date",
    "wedding_time",
    "location_id",
    "celebrant_id",
    "is_community",
    "interview_at",
    "bride_name",
    "bride_whatsapp",
    "groom_name",
    "groom_whatsapp",
    "with_civil_effect",
    "transfer_type",
    "observations",
];
const LOCATION_COLUMNS: &[&str] = &["name", "address", "capacity", "is_active"];
const CELEBRANT_COLUMNS: &[&str] = &["name", "title", "phone", "is_active"];
const CONFIG_COLUMNS: &[&str] = &["config_key", "config_value"];

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();
    if columns.is_empty() {
        return Err(SqlError::Parse(format!("INSERT INTO {table} needs a column list")));
    }
    let rows = extract_all_insert_rows(insert)?;

    let table: &'static str = match table.as_str() {
        "weddings" => "weddings",
        "locations" => "locations",
        "celebrants" => "celebrants",
        "system_config" => "system_config",
        _ => return Err(SqlError::UnknownTable(table)),
    };
    let mut parsed = Vec::with_capacity(rows.len());
    for values in rows {
        if values.len() != columns.len() {
            return Err(SqlError::WrongArity(table, columns.len(), values.len()));
        }
        parsed.push(columns.iter().cloned().zip(values.iter()).collect::<Vec<_>>());
    }

    if table == "system_config" {
        let mut entries = Vec::with_capacity(parsed.len());
        for cells in parsed {
            let row = Row::new(table, cells, CONFIG_COLUMNS)?;
            entries.push((
                parse_text(row.require("config_key")?)?,
                parse_text(row.require("config_value")?)?,
            ));
        }
        return Ok(Command::SetConfig { entries });
    }

    if parsed.len() != 1 {
        return Err(SqlError::Unsupported(format!("multi-row INSERT into {table}")));
    }
    let cells = parsed.remove(0);
    match table {
        "weddings" => {
            let row = Row::new(table, cells, WEDDING_COLUMNS)?;
            Ok(Command::InsertWedding { draft: wedding_draft(&row)? })
        }
        "locations" => {
            let row = Row::new(table, cells, LOCATION_COLUMNS)?;
            Ok(Command::InsertLocation {
                name: parse_text(row.require("name")?)?,
                address: row.get("address").map(parse_text_or_null).transpose()?.flatten(),
                capacity: row.get("capacity").map(parse_u32_or_null).transpose()?.flatten(),
            })
        }
        _ => {
            let row = Row::new(table, cells, CELEBRANT_COLUMNS)?;
            Ok(Command::InsertCelebrant {
                name: parse_text(row.require("name")?)?,
                title: parse_text(row.require("title")?)?,
                phone: row.get("phone").map(parse_text_or_null).transpose()?.flatten(),
            })
        }
    }
}

fn wedding_draft(row: &Row<'_>) -> Result<WeddingDraft, SqlError> {
    let slot = BookingInput::new(
        parse_date_expr("wedding_date", row.require("wedding_date")?)?,
        parse_time_expr(row.require("wedding_time")?)?,
        parse_i64_expr(row.require("location_id")?)?,
        parse_i64_expr(row.require("celebrant_id")?)?,
        row.get("is_community").map(parse_bool).transpose()?.unwrap_or(false),
    );
    let text = |col: &'static str| -> Result<String, SqlError> {
        Ok(row.get(col).map(parse_text_or_null).transpose()?.flatten().unwrap_or_default())
    };
    Ok(WeddingDraft {
        slot,
        interview_at: row
            .get("interview_at")
            .map(|e| parse_datetime_or_null("interview_at", e))
            .transpose()?
            .flatten(),
        couple: CoupleDetails {
            bride_name: text("bride_name")?,
            bride_whatsapp: text("bride_whatsapp")?,
            groom_name: text("groom_name")?,
            groom_whatsapp: text("groom_whatsapp")?,
        },
        with_civil_effect: row.get("with_civil_effect").map(parse_bool).transpose()?.unwrap_or(false),
        transfer_type: row
            .get("transfer_type")
            .map(parse_transfer_type)
            .transpose()?
            .unwrap_or_default(),
        observations: row.get("observations").map(parse_text_or_null).transpose()?.flatten(),
    })
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    relation: &TableFactor,
    assignments: &[Assignment],
    selection: Option<&Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let mut sets = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => {
                object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?
            }
            AssignmentTarget::Tuple(_) => return Err(SqlError::Unsupported("tuple assignment".into())),
        };
        sets.push((column, &assignment.value));
    }
    let predicates = where_predicates(selection)?;

    match table.as_str() {
        "weddings" => {
            let id = where_id(&predicates, "wedding_id", parse_ulid_expr)?;
            let mut changes = WeddingChanges::default();
            for (column, value) in sets {
                set_wedding_column(&mut changes, &column, value)?;
            }
            Ok(Command::UpdateWedding { id, changes })
        }
        "locations" => {
            let id = where_id(&predicates, "location_id", parse_i64_expr)?;
            let mut changes = LocationChanges::default();
            for (column, value) in sets {
                match column.as_str() {
                    "name" => changes.name = Some(parse_text(value)?),
                    "address" => changes.address = Some(parse_text_or_null(value)?),
                    "capacity" => changes.capacity = Some(parse_u32_or_null(value)?),
                    "is_active" => changes.is_active = Some(parse_bool(value)?),
                    _ => return Err(SqlError::UnknownColumn("locations", column)),
                }
            }
            Ok(Command::UpdateLocation { id, changes })
        }
        "celebrants" => {
            let id = where_id(&predicates, "celebrant_id", parse_i64_expr)?;
            let mut changes = CelebrantChanges::default();
            for (column, value) in sets {
                match column.as_str() {
                    "name" => changes.name = Some(parse_text(value)?),
                    "title" => changes.title = Some(parse_text(value)?),
                    "phone" => changes.phone = Some(parse_text_or_null(value)?),
                    "is_active" => changes.is_active = Some(parse_bool(value)?),
                    _ => return Err(SqlError::UnknownColumn("celebrants", column)),
                }
            }
            Ok(Command::UpdateCelebrant { id, changes })
        }
        "system_config" => {
            let key = where_id(&predicates, "config_key", parse_text)?;
            let value = match sets.as_slice() {
                [(column, value)] if column == "config_value" => parse_text(value)?,
                _ => return Err(SqlError::Unsupported("system_config updates set config_value only".into())),
            };
            Ok(Command::SetConfig { entries: vec![(key, value)] })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn set_wedding_column(changes: &mut WeddingChanges, column: &str, value: &Expr) -> Result<(), SqlError> {
    match column {
        "wedding_date" => changes.wedding_date = Some(parse_date_expr("wedding_date", value)?),
        "wedding_time" => changes.wedding_time = Some(parse_time_expr(value)?),
        "location_id" => changes.location_id = Some(parse_i64_expr(value)?),
        "celebrant_id" => changes.celebrant_id = Some(parse_i64_expr(value)?),
        "is_community" => changes.is_community = Some(parse_bool(value)?),
        "interview_at" => changes.interview_at = Some(parse_datetime_or_null("interview_at", value)?),
        "bride_name" => changes.bride_name = Some(parse_text(value)?),
        "bride_whatsapp" => changes.bride_whatsapp = Some(parse_text(value)?),
        "groom_name" => changes.groom_name = Some(parse_text(value)?),
        "groom_whatsapp" => changes.groom_whatsapp = Some(parse_text(value)?),
        "with_civil_effect" => changes.with_civil_effect = Some(parse_bool(value)?),
        "transfer_type" => changes.transfer_type = Some(parse_transfer_type(value)?),
        "observations" => changes.observations = Some(parse_text_or_null(value)?),
        "status" => changes.status = Some(parse_status(value)?),
        other => return Err(SqlError::UnknownColumn("weddings", other.to_string())),
    }
    Ok(())
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let predicates = where_predicates(delete.selection.as_ref())?;

    match table.as_str() {
        "weddings" => Ok(Command::DeleteWedding {
            id: where_id(&predicates, "wedding_id", parse_ulid_expr)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let predicates = where_predicates(select.selection.as_ref())?;

    match table.as_str() {
        "weddings" => select_weddings(&predicates),
        "conflicts" => select_conflicts(&predicates),
        "proclamations" => {
            let mut target = None;
            for p in &predicates {
                match (p.column.as_str(), &p.op) {
                    ("wedding_date", BinaryOperator::Eq) => {
                        target = Some(ProclamationTarget::Date(parse_date_expr("wedding_date", p.value)?))
                    }
                    ("wedding_id", BinaryOperator::Eq) => {
                        target = Some(ProclamationTarget::Wedding(parse_ulid_expr(p.value)?))
                    }
                    _ => return Err(p.unsupported("proclamations")),
                }
            }
            Ok(Command::SelectProclamations {
                target: target.ok_or(SqlError::MissingFilter("wedding_date"))?,
            })
        }
        "calendar" => Ok(Command::SelectCalendar { month: month_filter(&predicates, "calendar")? }),
        "statistics" => Ok(Command::SelectStatistics { month: month_filter(&predicates, "statistics")? }),
        "reminders" => {
            let mut at = None;
            for p in &predicates {
                match (p.column.as_str(), &p.op) {
                    ("due_at", BinaryOperator::LtEq) => at = parse_datetime_or_null("due_at", p.value)?,
                    _ => return Err(p.unsupported("reminders")),
                }
            }
            Ok(Command::SelectReminders { at })
        }
        "locations" | "celebrants" => {
            let mut is_active = None;
            for p in &predicates {
                match (p.column.as_str(), &p.op) {
                    ("is_active", BinaryOperator::Eq) => is_active = Some(parse_bool(p.value)?),
                    _ => return Err(p.unsupported(&table)),
                }
            }
            if table == "locations" {
                Ok(Command::SelectLocations { is_active })
            } else {
                Ok(Command::SelectCelebrants { is_active })
            }
        }
        "system_config" => {
            let mut key = None;
            for p in &predicates {
                match (p.column.as_str(), &p.op) {
                    ("config_key", BinaryOperator::Eq) => key = Some(parse_text(p.value)?),
                    _ => return Err(p.unsupported("system_config")),
                }
            }
            Ok(Command::SelectConfig { key })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn select_weddings(predicates: &[Predicate<'_>]) -> Result<Command, SqlError> {
    let mut id = None;
    let mut filter = WeddingFilter::default();
    for p in predicates {
        match (p.column.as_str(), &p.op) {
            ("wedding_id" | "id", BinaryOperator::Eq) => id = Some(parse_ulid_expr(p.value)?),
            ("name", BinaryOperator::Eq) => filter.name = Some(parse_text(p.value)?),
            ("wedding_date", BinaryOperator::Eq) => {
                let date = parse_date_expr("wedding_date", p.value)?;
                filter.date_from = Some(date);
                filter.date_to = Some(date);
            }
            ("wedding_date", BinaryOperator::GtEq) => {
                filter.date_from = Some(parse_date_expr("wedding_date", p.value)?)
            }
            ("wedding_date", BinaryOperator::LtEq) => filter.date_to = Some(parse_date_expr("wedding_date", p.value)?),
            ("location_id", BinaryOperator::Eq) => filter.location_id = Some(parse_i64_expr(p.value)?),
            ("celebrant_id", BinaryOperator::Eq) => filter.celebrant_id = Some(parse_i64_expr(p.value)?),
            ("is_community", BinaryOperator::Eq) => filter.is_community = Some(parse_bool(p.value)?),
            ("status", BinaryOperator::Eq) => filter.status = Some(parse_status(p.value)?),
            _ => return Err(p.unsupported("weddings")),
        }
    }
    Ok(Command::SelectWeddings { id, filter })
}

fn select_conflicts(predicates: &[Predicate<'_>]) -> Result<Command, SqlError> {
    let (mut date, mut time, mut location, mut celebrant) = (None, None, None, None);
    let mut is_community = false;
    let mut exclude = None;
    for p in predicates {
        if p.op != BinaryOperator::Eq {
            return Err(p.unsupported("conflicts"));
        }
        match p.column.as_str() {
            "wedding_date" => date = Some(parse_date_expr("wedding_date", p.value)?),
            "wedding_time" => time = Some(parse_time_expr(p.value)?),
            "location_id" => location = Some(parse_i64_expr(p.value)?),
            "celebrant_id" => celebrant = Some(parse_i64_expr(p.value)?),
            "is_community" => is_community = parse_bool(p.value)?,
            "wedding_id" => exclude = Some(parse_ulid_expr(p.value)?),
            _ => return Err(p.unsupported("conflicts")),
        }
    }
    Ok(Command::SelectConflicts {
        candidate: BookingInput::new(
            date.ok_or(SqlError::MissingFilter("wedding_date"))?,
            time.ok_or(SqlError::MissingFilter("wedding_time"))?,
            location.ok_or(SqlError::MissingFilter("location_id"))?,
            celebrant.ok_or(SqlError::MissingFilter("celebrant_id"))?,
            is_community,
        ),
        exclude,
    })
}

fn month_filter(predicates: &[Predicate<'_>], table: &'static str) -> Result<MonthKey, SqlError> {
    let (mut year, mut month) = (None, None);
    for p in predicates {
        match (p.column.as_str(), &p.op) {
            ("year", BinaryOperator::Eq) => year = Some(parse_i64_expr(p.value)?),
            ("month", BinaryOperator::Eq) => month = Some(parse_i64_expr(p.value)?),
            _ => return Err(p.unsupported(table)),
        }
    }
    let year = year.ok_or(SqlError::MissingFilter("year"))?;
    let month = month.ok_or(SqlError::MissingFilter("month"))?;
    i32::try_from(year)
        .ok()
        .zip(u32::try_from(month).ok())
        .and_then(|(y, m)| MonthKey::new(y, m))
        .ok_or_else(|| SqlError::BadValue(format!("no such month: {year}-{month}")))
}

// ── WHERE ─────────────────────────────────────────────────────

/// One `column <op> value` term of a conjunctive WHERE clause.
struct Predicate<'a> {
    column: String,
    op: BinaryOperator,
    value: &'a Expr,
}

impl Predicate<'_> {
    fn unsupported(&self, table: &str) -> SqlError {
        SqlError::Unsupported(format!("filter {} {} on {table}", self.column, self.op))
    }
}

fn where_predicates(selection: Option<&Expr>) -> Result<Vec<Predicate<'_>>, SqlError> {
    let mut out = Vec::new();
    if let Some(expr) = selection {
        collect_predicates(expr, &mut out)?;
    }
    Ok(out)
}

fn collect_predicates<'a>(expr: &'a Expr, out: &mut Vec<Predicate<'a>>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_predicates(inner, out),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_predicates(left, out)?;
            collect_predicates(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on expression {left}")))?;
            out.push(Predicate {
                column,
                op: op.clone(),
                value: right,
            });
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

/// The table's key from an equality filter. A bare `id` column is accepted too.
fn where_id<T>(
    predicates: &[Predicate<'_>],
    column: &'static str,
    parse: impl Fn(&Expr) -> Result<T, SqlError>,
) -> Result<T, SqlError> {
    predicates
        .iter()
        .find(|p| p.op == BinaryOperator::Eq && (p.column == column || p.column == "id"))
        .ok_or(SqlError::MissingFilter(column))
        .and_then(|p| parse(p.value))
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

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(&values.rows)
        }
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

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) { Ok(None) } else { parse_text(expr).map(Some) }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_text(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => {
                s.trim().parse().map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32_or_null(expr: &Expr) -> Result<Option<u32>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    let v = parse_i64_expr(expr)?;
    u32::try_from(v)
        .map(Some)
        .map_err(|_| SqlError::BadValue(format!("{v} out of range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" | "yes" => Ok(true),
                "false" | "f" | "0" | "no" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn field_err(e: FieldError) -> SqlError {
    SqlError::BadValue(e.to_string())
}

fn parse_date_expr(column: &'static str, expr: &Expr) -> Result<NaiveDate, SqlError> {
    parse_date(column, &parse_text(expr)?).map_err(field_err)
}

fn parse_time_expr(expr: &Expr) -> Result<NaiveTime, SqlError> {
    normalize_time(&parse_text(expr)?).map_err(field_err)
}

fn parse_datetime_or_null(column: &'static str, expr: &Expr) -> Result<Option<NaiveDateTime>, SqlError> {
    match parse_text_or_null(expr)? {
        Some(s) => parse_datetime(column, &s).map(Some).map_err(field_err),
        None => Ok(None),
    }
}

fn parse_status(expr: &Expr) -> Result<WeddingStatus, SqlError> {
    parse_text(expr)?.parse().map_err(SqlError::BadValue)
}

fn parse_transfer_type(expr: &Expr) -> Result<TransferType, SqlError> {
    match parse_text_or_null(expr)? {
        Some(s) => s.parse().map_err(SqlError::BadValue),
        None => Ok(TransferType::None),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
    /// A literal that parsed as SQL but is not a valid value for its column.
    BadValue(String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing column {c}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::BadValue(s) => write!(f, "bad value: {s}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const WEDDING_ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn parse_insert_wedding() {
        let sql = "INSERT INTO weddings (wedding_date, wedding_time, location_id, celebrant_id, is_community, \
                   interview_at, bride_name, bride_whatsapp, groom_name, groom_whatsapp, with_civil_effect) \
                   VALUES ('2040-06-16', '15:00:30', 3, 2, false, '2040-05-02 19:00', 'Ana', '11987654321', \
                   'Rui', '11912345678', true)";
        let cmd = parse_sql(sql).unwrap();
        match cmd {
            Command::InsertWedding { draft } => {
                assert_eq!(draft.slot, BookingInput::new(date(2040, 6, 16), time(15, 0), 3, 2, false));
                assert_eq!(draft.interview_at, Some(date(2040, 5, 2).and_time(time(19, 0))));
                assert_eq!(draft.couple.bride_name, "Ana");
                assert_eq!(draft.couple.groom_whatsapp, "11912345678");
                assert!(draft.with_civil_effect);
                assert_eq!(draft.transfer_type, TransferType::None);
                assert_eq!(draft.observations, None);
            }
            _ => panic!("expected InsertWedding, got {cmd:?}"),
        }
    }

    #[test]
    fn insert_wedding_requires_slot_columns() {
        let sql = "INSERT INTO weddings (wedding_date, location_id, celebrant_id) VALUES ('2040-06-16', 1, 1)";
        assert!(matches!(
            parse_sql(sql),
            Err(SqlError::MissingColumn("weddings", "wedding_time"))
        ));
    }

    #[test]
    fn insert_wedding_rejects_unknown_column() {
        let sql = "INSERT INTO weddings (wedding_date, colour) VALUES ('2040-06-16', 'white')";
        assert!(matches!(parse_sql(sql), Err(SqlError::UnknownColumn("weddings", c)) if c == "colour"));
    }

    #[test]
    fn insert_wedding_bad_date_is_bad_value() {
        let sql = "INSERT INTO weddings (wedding_date, wedding_time, location_id, celebrant_id) \
                   VALUES ('2040-02-30', '10:00', 1, 1)";
        assert!(matches!(parse_sql(sql), Err(SqlError::BadValue(_))));
    }

    #[test]
    fn insert_arity_mismatch() {
        let sql = "INSERT INTO locations (name, address) VALUES ('Matriz')";
        assert!(matches!(parse_sql(sql), Err(SqlError::WrongArity("locations", 2, 1))));
    }

    #[test]
    fn parse_update_wedding_columns() {
        let sql = format!(
            "UPDATE weddings SET wedding_time = '16:30', observations = NULL, transfer_type = 'incoming' \
             WHERE wedding_id = '{WEDDING_ID}'"
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::UpdateWedding { id, changes } => {
                assert_eq!(id.to_string(), WEDDING_ID);
                assert_eq!(changes.wedding_time, Some(time(16, 30)));
                assert_eq!(changes.observations, Some(None));
                assert_eq!(changes.transfer_type, Some(TransferType::Incoming));
                assert!(!changes.is_status_only());
            }
            _ => panic!("expected UpdateWedding, got {cmd:?}"),
        }
    }

    #[test]
    fn update_status_only() {
        let sql = format!("UPDATE weddings SET status = 'cancelled' WHERE id = '{WEDDING_ID}'");
        match parse_sql(&sql).unwrap() {
            Command::UpdateWedding { changes, .. } => {
                assert_eq!(changes.status, Some(WeddingStatus::Cancelled));
                assert!(changes.is_status_only());
            }
            other => panic!("expected UpdateWedding, got {other:?}"),
        }
    }

    #[test]
    fn update_without_key_is_rejected() {
        let sql = "UPDATE weddings SET status = 'HELD'";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingFilter("wedding_id"))));
    }

    #[test]
    fn changes_apply_over_current_booking() {
        let current = Wedding {
            id: Ulid::new(),
            slot: BookingInput::new(date(2040, 6, 16), time(15, 0), 1, 1, false),
            status: WeddingStatus::Scheduled,
            scheduled_on: date(2040, 1, 1),
            interview_at: None,
            couple: CoupleDetails {
                bride_name: "ANA".into(),
                bride_whatsapp: "(11) 98765-4321".into(),
                groom_name: "RUI".into(),
                groom_whatsapp: "(11) 91234-5678".into(),
            },
            with_civil_effect: false,
            transfer_type: TransferType::None,
            observations: Some("note".into()),
        };
        let changes = WeddingChanges {
            location_id: Some(2),
            groom_name: Some("LUIS".into()),
            observations: Some(None),
            ..Default::default()
        };
        let draft = changes.apply(&current);
        assert_eq!(draft.slot, BookingInput::new(date(2040, 6, 16), time(15, 0), 2, 1, false));
        assert_eq!(draft.couple.bride_name, "ANA");
        assert_eq!(draft.couple.groom_name, "LUIS");
        assert_eq!(draft.observations, None);
    }

    #[test]
    fn parse_delete_wedding() {
        let sql = format!("DELETE FROM weddings WHERE wedding_id = '{WEDDING_ID}'");
        match parse_sql(&sql).unwrap() {
            Command::DeleteWedding { id } => assert_eq!(id.to_string(), WEDDING_ID),
            other => panic!("expected DeleteWedding, got {other:?}"),
        }
        assert!(matches!(
            parse_sql("DELETE FROM locations WHERE location_id = 1"),
            Err(SqlError::UnknownTable(_))
        ));
    }

    #[test]
    fn parse_select_weddings_filters() {
        let sql = "SELECT * FROM weddings WHERE wedding_date >= '2040-06-01' AND wedding_date <= '2040-06-30' \
                   AND (location_id = 3 AND status = 'SCHEDULED') AND name = 'ana'";
        match parse_sql(sql).unwrap() {
            Command::SelectWeddings { id, filter } => {
                assert_eq!(id, None);
                assert_eq!(filter.date_from, Some(date(2040, 6, 1)));
                assert_eq!(filter.date_to, Some(date(2040, 6, 30)));
                assert_eq!(filter.location_id, Some(3));
                assert_eq!(filter.status, Some(WeddingStatus::Scheduled));
                assert_eq!(filter.name.as_deref(), Some("ana"));
            }
            other => panic!("expected SelectWeddings, got {other:?}"),
        }
    }

    #[test]
    fn select_weddings_on_one_day() {
        match parse_sql("SELECT * FROM weddings WHERE wedding_date = '2040-06-16'").unwrap() {
            Command::SelectWeddings { filter, .. } => {
                assert_eq!(filter.date_from, Some(date(2040, 6, 16)));
                assert_eq!(filter.date_to, Some(date(2040, 6, 16)));
            }
            other => panic!("expected SelectWeddings, got {other:?}"),
        }
    }

    #[test]
    fn select_weddings_rejects_unknown_filter() {
        assert!(matches!(
            parse_sql("SELECT * FROM weddings WHERE colour = 'white'"),
            Err(SqlError::Unsupported(_))
        ));
    }

    #[test]
    fn parse_select_conflicts() {
        let sql = format!(
            "SELECT * FROM conflicts WHERE wedding_date = '2040-06-16' AND wedding_time = '15:00:45' \
             AND location_id = 3 AND celebrant_id = 2 AND is_community = true AND wedding_id = '{WEDDING_ID}'"
        );
        match parse_sql(&sql).unwrap() {
            Command::SelectConflicts { candidate, exclude } => {
                assert_eq!(candidate, BookingInput::new(date(2040, 6, 16), time(15, 0), 3, 2, true));
                assert_eq!(exclude.map(|u| u.to_string()).as_deref(), Some(WEDDING_ID));
            }
            other => panic!("expected SelectConflicts, got {other:?}"),
        }
    }

    #[test]
    fn conflicts_need_full_slot() {
        let sql = "SELECT * FROM conflicts WHERE wedding_date = '2040-06-16' AND wedding_time = '15:00'";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingFilter("location_id"))));
    }

    #[test]
    fn malformed_time_is_a_bad_value() {
        for raw in ["123:45", "10:300", "10:30:5x"] {
            let sql = format!(
                "SELECT * FROM conflicts WHERE wedding_date = '2040-06-16' AND wedding_time = '{raw}' \
                 AND location_id = 1 AND celebrant_id = 1"
            );
            assert!(matches!(parse_sql(&sql), Err(SqlError::BadValue(_))), "{raw}");
        }
    }

    #[test]
    fn parse_select_proclamations() {
        match parse_sql("SELECT * FROM proclamations WHERE wedding_date = '2025-06-15'").unwrap() {
            Command::SelectProclamations { target } => {
                assert_eq!(target, ProclamationTarget::Date(date(2025, 6, 15)))
            }
            other => panic!("expected SelectProclamations, got {other:?}"),
        }
        assert!(matches!(
            parse_sql("SELECT * FROM proclamations"),
            Err(SqlError::MissingFilter("wedding_date"))
        ));
    }

    #[test]
    fn parse_calendar_and_statistics() {
        let june = MonthKey::new(2040, 6).unwrap();
        assert_eq!(
            parse_sql("SELECT * FROM calendar WHERE year = 2040 AND month = 6").unwrap(),
            Command::SelectCalendar { month: june }
        );
        assert_eq!(
            parse_sql("SELECT * FROM statistics WHERE month = 6 AND year = 2040").unwrap(),
            Command::SelectStatistics { month: june }
        );
        assert!(matches!(
            parse_sql("SELECT * FROM calendar WHERE year = 2040 AND month = 13"),
            Err(SqlError::BadValue(_))
        ));
    }

    #[test]
    fn parse_select_reminders() {
        assert_eq!(parse_sql("SELECT * FROM reminders").unwrap(), Command::SelectReminders { at: None });
        assert_eq!(
            parse_sql("SELECT * FROM reminders WHERE due_at <= '2040-06-15 10:00'").unwrap(),
            Command::SelectReminders {
                at: Some(date(2040, 6, 15).and_time(time(10, 0)))
            }
        );
    }

    #[test]
    fn parse_location_statements() {
        assert_eq!(
            parse_sql("INSERT INTO locations (name, address, capacity) VALUES ('Matriz', NULL, 300)").unwrap(),
            Command::InsertLocation {
                name: "Matriz".into(),
                address: None,
                capacity: Some(300),
            }
        );
        assert_eq!(
            parse_sql("UPDATE locations SET is_active = false WHERE location_id = 4").unwrap(),
            Command::UpdateLocation {
                id: 4,
                changes: LocationChanges {
                    is_active: Some(false),
                    ..Default::default()
                },
            }
        );
        assert_eq!(
            parse_sql("SELECT * FROM locations WHERE is_active = true").unwrap(),
            Command::SelectLocations { is_active: Some(true) }
        );
    }

    #[test]
    fn parse_celebrant_statements() {
        assert_eq!(
            parse_sql("INSERT INTO celebrants (name, title) VALUES ('João', 'Pe.')").unwrap(),
            Command::InsertCelebrant {
                name: "João".into(),
                title: "Pe.".into(),
                phone: None,
            }
        );
        match parse_sql("UPDATE celebrants SET phone = '11912345678', name = 'José' WHERE id = 2").unwrap() {
            Command::UpdateCelebrant { id, changes } => {
                assert_eq!(id, 2);
                assert_eq!(changes.phone, Some(Some("11912345678".into())));
                assert!(changes.touches_details());
            }
            other => panic!("expected UpdateCelebrant, got {other:?}"),
        }
        assert_eq!(
            parse_sql("SELECT * FROM celebrants").unwrap(),
            Command::SelectCelebrants { is_active: None }
        );
    }

    #[test]
    fn parse_config_statements() {
        assert_eq!(
            parse_sql(
                "INSERT INTO system_config (config_key, config_value) VALUES ('max_weddings_per_day', '6'), ('site_name', 'Matriz')"
            )
            .unwrap(),
            Command::SetConfig {
                entries: vec![
                    ("max_weddings_per_day".into(), "6".into()),
                    ("site_name".into(), "Matriz".into()),
                ],
            }
        );
        assert_eq!(
            parse_sql("UPDATE system_config SET config_value = '2' WHERE config_key = 'max_community_weddings'")
                .unwrap(),
            Command::SetConfig {
                entries: vec![("max_community_weddings".into(), "2".into())],
            }
        );
        assert_eq!(
            parse_sql("SELECT * FROM system_config").unwrap(),
            Command::SelectConfig { key: None }
        );
    }

    #[test]
    fn parse_listen_and_unlisten() {
        assert_eq!(
            parse_sql("LISTEN month_2040_06;").unwrap(),
            Command::Listen {
                channel: "month_2040_06".into()
            }
        );
        assert_eq!(
            parse_sql("unlisten \"month_2040_06\"").unwrap(),
            Command::Unlisten {
                channel: "month_2040_06".into()
            }
        );
        assert_eq!(parse_sql("UNLISTEN *").unwrap(), Command::UnlistenAll);
    }

    #[test]
    fn unknown_table() {
        assert!(matches!(parse_sql("SELECT * FROM bookings"), Err(SqlError::UnknownTable(t)) if t == "bookings"));
    }

    #[test]
    fn empty_and_garbage() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
        assert!(matches!(parse_sql("SELEKT"), Err(SqlError::Parse(_))));
        assert!(matches!(parse_sql("CREATE TABLE t (x INT)"), Err(SqlError::Unsupported(_))));
    }
}
