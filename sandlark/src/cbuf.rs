//! Fixed-memory ring of time-bucketed numeric rows with typed columns.
//!
//! Rows advance with time; writes in the future advance the ring and clear
//! exactly the newly exposed rows, reads and writes older than the ring's
//! horizon report out-of-range. Two text forms exist: the dashboard form
//! (header line plus one line per row, oldest first) and the single-line
//! snapshot form embedded in preserved state.

use mlua::{UserData, UserDataMethods, Value};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const NS_PER_SEC: i64 = 1_000_000_000;
const MAX_HEADER_NAME: usize = 15;
const MAX_SECONDS_PER_ROW: u32 = 3600;

/// Column aggregation hint carried in the dashboard header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    Count,
    Min,
    Max,
    Avg,
    Delta,
    Percentage,
}

impl Aggregation {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "count" => Some(Aggregation::Count),
            "min" => Some(Aggregation::Min),
            "max" => Some(Aggregation::Max),
            "avg" => Some(Aggregation::Avg),
            "delta" => Some(Aggregation::Delta),
            "percentage" => Some(Aggregation::Percentage),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregation::Count => "count",
            Aggregation::Min => "min",
            Aggregation::Max => "max",
            Aggregation::Avg => "avg",
            Aggregation::Delta => "delta",
            Aggregation::Percentage => "percentage",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub aggregation: Aggregation,
}

#[derive(Debug, Error, PartialEq)]
pub enum CbufError {
    #[error("rows must be at least 2, got {0}")]
    InvalidRows(usize),
    #[error("columns must be at least 1, got {0}")]
    InvalidColumns(usize),
    #[error("seconds_per_row must be 1..=3600, got {0}")]
    InvalidSecondsPerRow(u32),
    #[error("invalid header line: {0}")]
    BadHeader(String),
    #[error("buffer shape mismatch")]
    ShapeMismatch,
    #[error("too many values")]
    TooManyValues,
    #[error("too few values")]
    TooFewValues,
    #[error("invalid value '{0}'")]
    BadValue(String),
}

#[derive(Debug, Clone)]
pub struct CircularBuffer {
    rows: usize,
    columns: usize,
    seconds_per_row: u32,
    /// Epoch seconds of the newest row, aligned to `seconds_per_row`.
    current_time: i64,
    current_row: usize,
    headers: Vec<Header>,
    values: Vec<f64>,
}

impl CircularBuffer {
    pub fn new(rows: usize, columns: usize, seconds_per_row: u32) -> Result<Self, CbufError> {
        if rows < 2 {
            return Err(CbufError::InvalidRows(rows));
        }
        if columns < 1 {
            return Err(CbufError::InvalidColumns(columns));
        }
        if seconds_per_row < 1 || seconds_per_row > MAX_SECONDS_PER_ROW {
            return Err(CbufError::InvalidSecondsPerRow(seconds_per_row));
        }
        let headers = (0..columns)
            .map(|_| Header {
                name: String::new(),
                aggregation: Aggregation::Count,
            })
            .collect();
        Ok(Self {
            rows,
            columns,
            seconds_per_row,
            current_time: 0,
            current_row: 0,
            headers,
            values: vec![0.0; rows * columns],
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    pub fn seconds_per_row(&self) -> u32 {
        self.seconds_per_row
    }

    /// Epoch seconds of the newest row.
    pub fn current_time(&self) -> i64 {
        self.current_time
    }

    pub fn current_row(&self) -> usize {
        self.current_row
    }

    /// Set a column header. The name is truncated to 15 bytes with
    /// non-alphanumeric bytes rewritten to `_`; an unknown aggregation tag
    /// leaves the existing one unchanged. Returns the 1-based column.
    pub fn set_header(&mut self, col: usize, name: &str, aggregation: &str) -> usize {
        let clean: String = name
            .bytes()
            .take(MAX_HEADER_NAME)
            .map(|b| if b.is_ascii_alphanumeric() { b as char } else { '_' })
            .collect();
        self.headers[col].name = clean;
        if let Some(agg) = Aggregation::parse(aggregation) {
            self.headers[col].aggregation = agg;
        }
        col + 1
    }

    pub fn header(&self, col: usize) -> Option<&Header> {
        self.headers.get(col)
    }

    /// Add `value` to the cell for `ns`/`col`, advancing the ring when the
    /// timestamp is newer than the current row. Returns the new cell value,
    /// or None when the timestamp falls off the ring.
    pub fn add(&mut self, ns: i64, col: usize, value: f64) -> Option<f64> {
        let idx = self.cell_for_write(ns, col)?;
        let cell = self.values[idx];
        let next = if cell.is_nan() { value } else { cell + value };
        self.values[idx] = next;
        Some(next)
    }

    /// Overwrite the cell for `ns`/`col`, advancing like `add`.
    pub fn set(&mut self, ns: i64, col: usize, value: f64) -> Option<f64> {
        let idx = self.cell_for_write(ns, col)?;
        self.values[idx] = value;
        Some(value)
    }

    /// Read the cell for `ns`/`col` without advancing the ring.
    pub fn get(&self, ns: i64, col: usize) -> Option<f64> {
        if col >= self.columns {
            return None;
        }
        let aligned = self.align(ns);
        if aligned > self.current_time {
            return None;
        }
        let row = self.row_for(aligned)?;
        Some(self.values[row * self.columns + col])
    }

    fn align(&self, ns: i64) -> i64 {
        let t = ns.div_euclid(NS_PER_SEC);
        t - t.rem_euclid(self.seconds_per_row as i64)
    }

    fn row_for(&self, aligned: i64) -> Option<usize> {
        let offset = (aligned - self.current_time) / self.seconds_per_row as i64;
        if offset <= -(self.rows as i64) {
            return None;
        }
        let row = (self.current_row as i64 + offset).rem_euclid(self.rows as i64);
        Some(row as usize)
    }

    fn cell_for_write(&mut self, ns: i64, col: usize) -> Option<usize> {
        if col >= self.columns {
            return None;
        }
        let aligned = self.align(ns);
        if aligned > self.current_time {
            let advance = ((aligned - self.current_time) / self.seconds_per_row as i64) as usize;
            if advance >= self.rows {
                self.values.fill(0.0);
            } else {
                for i in 1..=advance {
                    let row = (self.current_row + i) % self.rows;
                    self.values[row * self.columns..(row + 1) * self.columns].fill(0.0);
                }
            }
            self.current_row = (self.current_row + advance) % self.rows;
            self.current_time = aligned;
        }
        let row = self.row_for(aligned)?;
        Some(row * self.columns + col)
    }

    /// Epoch seconds of the oldest row.
    pub fn oldest_time(&self) -> i64 {
        self.current_time - (self.rows as i64 - 1) * self.seconds_per_row as i64
    }

    /// Dashboard text form: header line then one line per row, oldest
    /// first, values at 9 significant digits.
    pub fn to_text(&self) -> String {
        let info = serde_json::to_string(&self.headers).unwrap_or_else(|_| "[]".to_string());
        let mut out = String::with_capacity(self.values.len() * 8 + info.len() + 32);
        out.push_str(&format!(
            "{}\t{}\t{}\t{}\t{}\n",
            self.oldest_time(),
            self.rows,
            self.columns,
            self.seconds_per_row,
            info
        ));
        for i in 0..self.rows {
            let row = (self.current_row + 1 + i) % self.rows;
            let cells = &self.values[row * self.columns..(row + 1) * self.columns];
            for (c, v) in cells.iter().enumerate() {
                if c > 0 {
                    out.push('\t');
                }
                out.push_str(&format_g9(*v));
            }
            out.push('\n');
        }
        out
    }

    /// Parse the dashboard text form into this buffer. The text's shape
    /// must match the buffer's.
    pub fn from_text(&mut self, text: &str) -> Result<(), CbufError> {
        let mut lines = text.lines();
        let header = lines
            .next()
            .ok_or_else(|| CbufError::BadHeader("empty input".into()))?;
        let parts: Vec<&str> = header.split('\t').collect();
        if parts.len() != 5 {
            return Err(CbufError::BadHeader(header.to_string()));
        }
        let time: i64 = parts[0]
            .parse()
            .map_err(|_| CbufError::BadValue(parts[0].to_string()))?;
        let rows: usize = parts[1]
            .parse()
            .map_err(|_| CbufError::BadValue(parts[1].to_string()))?;
        let columns: usize = parts[2]
            .parse()
            .map_err(|_| CbufError::BadValue(parts[2].to_string()))?;
        let spr: u32 = parts[3]
            .parse()
            .map_err(|_| CbufError::BadValue(parts[3].to_string()))?;
        if rows != self.rows || columns != self.columns || spr != self.seconds_per_row {
            return Err(CbufError::ShapeMismatch);
        }
        let headers: Vec<Header> = serde_json::from_str(parts[4])
            .map_err(|_| CbufError::BadHeader(parts[4].to_string()))?;
        if headers.len() != self.columns {
            return Err(CbufError::BadHeader(parts[4].to_string()));
        }

        let mut values = vec![0.0f64; self.rows * self.columns];
        let mut row = 0usize;
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            if row >= self.rows {
                return Err(CbufError::TooManyValues);
            }
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() > self.columns {
                return Err(CbufError::TooManyValues);
            }
            if tokens.len() < self.columns {
                return Err(CbufError::TooFewValues);
            }
            for (c, token) in tokens.iter().enumerate() {
                values[row * self.columns + c] = token
                    .parse()
                    .map_err(|_| CbufError::BadValue(token.to_string()))?;
            }
            row += 1;
        }
        if row < self.rows {
            return Err(CbufError::TooFewValues);
        }

        self.headers = headers;
        self.values = values;
        // Rows were stored oldest-first; park the ring so row i maps back
        // to the i-th line.
        self.current_row = self.rows - 1;
        self.current_time = time + (self.rows as i64 - 1) * spr as i64;
        Ok(())
    }

    /// Snapshot string for preserved state: current_time, current_row, then
    /// every cell in memory order, space-separated.
    pub fn snapshot(&self) -> String {
        let mut out = String::with_capacity(self.values.len() * 8 + 16);
        out.push_str(&self.current_time.to_string());
        out.push(' ');
        out.push_str(&self.current_row.to_string());
        for v in &self.values {
            out.push(' ');
            out.push_str(&format_g9(*v));
        }
        out
    }

    /// Parse a snapshot string produced by `snapshot`.
    pub fn from_snapshot(&mut self, text: &str) -> Result<(), CbufError> {
        let mut tokens = text.split_whitespace();
        let time_tok = tokens.next().ok_or(CbufError::TooFewValues)?;
        let time: i64 = time_tok
            .parse()
            .map_err(|_| CbufError::BadValue(time_tok.to_string()))?;
        let row_tok = tokens.next().ok_or(CbufError::TooFewValues)?;
        let row: usize = row_tok
            .parse()
            .map_err(|_| CbufError::BadValue(row_tok.to_string()))?;
        if row >= self.rows {
            return Err(CbufError::BadValue(row_tok.to_string()));
        }
        let mut values = vec![0.0f64; self.rows * self.columns];
        for slot in values.iter_mut() {
            let token = tokens.next().ok_or(CbufError::TooFewValues)?;
            *slot = token
                .parse()
                .map_err(|_| CbufError::BadValue(token.to_string()))?;
        }
        if tokens.next().is_some() {
            return Err(CbufError::TooManyValues);
        }
        self.current_time = time;
        self.current_row = row;
        self.values = values;
        Ok(())
    }
}

// Equality is observable equality: same shape, same headers, same newest
// time, and the same cells in time order regardless of where the ring is
// parked. NaN cells compare equal to NaN.
impl PartialEq for CircularBuffer {
    fn eq(&self, other: &Self) -> bool {
        if self.rows != other.rows
            || self.columns != other.columns
            || self.seconds_per_row != other.seconds_per_row
            || self.current_time != other.current_time
            || self.headers != other.headers
        {
            return false;
        }
        for i in 0..self.rows {
            let a = (self.current_row + 1 + i) % self.rows;
            let b = (other.current_row + 1 + i) % other.rows;
            let left = &self.values[a * self.columns..(a + 1) * self.columns];
            let right = &other.values[b * other.columns..(b + 1) * other.columns];
            for (x, y) in left.iter().zip(right.iter()) {
                if !(x == y || (x.is_nan() && y.is_nan())) {
                    return false;
                }
            }
        }
        true
    }
}

/// `%0.9g`-equivalent formatting: 9 significant digits, trailing zeros
/// trimmed, scientific notation outside the `%f` range, `nan`/`inf` spelled
/// out the C way.
pub(crate) fn format_g9(v: f64) -> String {
    format_g(v, 9)
}

fn format_g(v: f64, precision: usize) -> String {
    if v.is_nan() {
        return "nan".to_string();
    }
    if v.is_infinite() {
        return if v.is_sign_negative() { "-inf" } else { "inf" }.to_string();
    }
    if v == 0.0 {
        return if v.is_sign_negative() { "-0" } else { "0" }.to_string();
    }
    let sci = format!("{:.*e}", precision.saturating_sub(1), v);
    let (mantissa, exp) = match sci.split_once('e') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => (sci.as_str(), 0),
    };
    if exp < -4 || exp >= precision as i32 {
        format!(
            "{}e{}{:02}",
            trim_zeros(mantissa),
            if exp < 0 { "-" } else { "+" },
            exp.abs()
        )
    } else {
        let decimals = (precision as i32 - 1 - exp).max(0) as usize;
        trim_zeros(&format!("{:.*}", decimals, v))
    }
}

fn trim_zeros(s: &str) -> String {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        s.to_string()
    }
}

fn lua_ns(value: &Value) -> mlua::Result<i64> {
    match value {
        Value::Integer(i) => Ok(*i),
        Value::Number(n) => Ok(*n as i64),
        other => Err(mlua::Error::RuntimeError(format!(
            "timestamp must be a number, got {}",
            other.type_name()
        ))),
    }
}

fn lua_col(cb: &CircularBuffer, col: i64) -> mlua::Result<usize> {
    if col < 1 || col as usize > cb.columns() {
        return Err(mlua::Error::RuntimeError(format!("invalid column {col}")));
    }
    Ok(col as usize - 1)
}

impl UserData for CircularBuffer {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method_mut("add", |_, this, (ns, col, value): (Value, i64, f64)| {
            let ns = lua_ns(&ns)?;
            let col = lua_col(this, col)?;
            match this.add(ns, col, value) {
                Some(v) => Ok(Value::Number(v)),
                None => Ok(Value::Nil),
            }
        });
        methods.add_method_mut("set", |_, this, (ns, col, value): (Value, i64, f64)| {
            let ns = lua_ns(&ns)?;
            let col = lua_col(this, col)?;
            match this.set(ns, col, value) {
                Some(v) => Ok(Value::Number(v)),
                None => Ok(Value::Nil),
            }
        });
        methods.add_method("get", |_, this, (ns, col): (Value, i64)| {
            let ns = lua_ns(&ns)?;
            let col = lua_col(this, col)?;
            match this.get(ns, col) {
                Some(v) => Ok(Value::Number(v)),
                None => Ok(Value::Nil),
            }
        });
        methods.add_method_mut(
            "set_header",
            |_, this, (col, name, aggregation): (i64, String, Option<String>)| {
                let col = lua_col(this, col)?;
                Ok(this.set_header(col, &name, aggregation.as_deref().unwrap_or("")) as i64)
            },
        );
        methods.add_method("get_header", |_, this, col: i64| {
            let col = lua_col(this, col)?;
            let header = &this.headers[col];
            Ok((header.name.clone(), header.aggregation.as_str()))
        });
        methods.add_method("current_time", |_, this, ()| {
            Ok(this.current_time() * NS_PER_SEC)
        });
        methods.add_method("rows", |_, this, ()| Ok(this.rows() as i64));
        methods.add_method("columns", |_, this, ()| Ok(this.columns() as i64));
        methods.add_method("seconds_per_row", |_, this, ()| {
            Ok(this.seconds_per_row() as i64)
        });
        methods.add_method_mut("from_string", |_, this, text: String| {
            this.from_snapshot(&text)
                .map_err(|e| mlua::Error::RuntimeError(format!("from_string() {e}")))
        });
    }
}
