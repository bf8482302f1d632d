//! A small in-memory row table and the operator that runs tasks on it.
//!
//! Rows carry a stable id assigned when the table is first built. Filters
//! keep ids intact, which is what lets the dependency merger intersect the
//! outputs of several filters over the same source.

mod ops;

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value as Cell;
use thiserror::Error;

use crate::merge::{Mergeable, Shape};

pub use self::ops::TableOperator;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FrameError {
    #[error("Unknown column '{0}'")]
    UnknownColumn(String),

    #[error("Row {row} has {found} cells, expected {expected}")]
    RowWidth {
        row: usize,
        expected: usize,
        found: usize,
    },

    #[error("Column '{column}' holds a non-numeric value: {value}")]
    NotNumeric { column: String, value: Cell },

    #[error("Cannot {operation} a grouped view, aggregate it first")]
    Grouped { operation: &'static str },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub id: u64,
    pub cells: Vec<Cell>,
}

/// Named columns over a list of rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl Frame {
    /// Builds a table, numbering the rows from zero.
    pub fn new<S: Into<String>>(
        columns: impl IntoIterator<Item = S>,
        rows: impl IntoIterator<Item = Vec<Cell>>,
    ) -> Result<Self, FrameError> {
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();

        let rows = rows
            .into_iter()
            .enumerate()
            .map(|(index, cells)| {
                if cells.len() != columns.len() {
                    return Err(FrameError::RowWidth {
                        row: index,
                        expected: columns.len(),
                        found: cells.len(),
                    });
                }

                Ok(Row {
                    id: index as u64,
                    cells,
                })
            })
            .collect::<Result<_, _>>()?;

        Ok(Self { columns, rows })
    }

    pub(crate) fn from_parts(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column(&self, name: &str) -> Result<usize, FrameError> {
        self.columns
            .iter()
            .position(|column| column == name)
            .ok_or_else(|| FrameError::UnknownColumn(name.to_owned()))
    }

    pub fn get<'a>(&self, row: &'a Row, column: &str) -> Option<&'a Cell> {
        row.cells.get(self.column(column).ok()?)
    }

    /// A table with the same columns and only the rows matching `keep`.
    pub fn select(&self, mut keep: impl FnMut(&Row) -> bool) -> Frame {
        Frame {
            columns: self.columns.clone(),
            rows: self.rows.iter().filter(|row| keep(row)).cloned().collect(),
        }
    }
}

/// How many rows `Display` prints before truncating.
const PREVIEW_ROWS: usize = 20;

impl Display for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let shown = &self.rows[..self.rows.len().min(PREVIEW_ROWS)];

        let cells: Vec<Vec<String>> = shown
            .iter()
            .map(|row| row.cells.iter().map(render_cell).collect())
            .collect();

        let widths: Vec<usize> = self
            .columns
            .iter()
            .enumerate()
            .map(|(index, column)| {
                cells
                    .iter()
                    .map(|row| row[index].chars().count())
                    .chain([column.chars().count()])
                    .max()
                    .unwrap_or(0)
            })
            .collect();

        for (index, column) in self.columns.iter().enumerate() {
            write!(f, "{column:>width$}  ", width = widths[index])?;
        }
        writeln!(f)?;

        for row in &cells {
            for (index, cell) in row.iter().enumerate() {
                write!(f, "{cell:>width$}  ", width = widths[index])?;
            }
            writeln!(f)?;
        }

        if self.rows.len() > shown.len() {
            writeln!(f, "... (showing {} of {} rows)", shown.len(), self.rows.len())?;
        }

        Ok(())
    }
}

fn render_cell(cell: &Cell) -> String {
    match cell {
        Cell::String(string) => string.clone(),
        Cell::Number(number) => match number.as_f64() {
            Some(float) if number.is_f64() => format!("{float:.2}"),
            _ => number.to_string(),
        },
        Cell::Null => String::new(),
        other => other.to_string(),
    }
}

/// Orders cells the way a filter compares them: numbers numerically, strings
/// lexically, and booleans and nulls among themselves. Cells of different
/// kinds are unordered.
pub(crate) fn compare_cells(a: &Cell, b: &Cell) -> Option<Ordering> {
    match (a, b) {
        (Cell::Number(a), Cell::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Cell::String(a), Cell::String(b)) => Some(a.cmp(b)),
        (Cell::Bool(a), Cell::Bool(b)) => Some(a.cmp(b)),
        (Cell::Null, Cell::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// A table partitioned by the values of one or more columns, waiting for an
/// aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grouped {
    by: Vec<String>,
    frame: Frame,
}

impl Grouped {
    pub fn new(by: Vec<String>, frame: Frame) -> Result<Self, FrameError> {
        for column in &by {
            frame.column(column)?;
        }
        Ok(Self { by, frame })
    }

    pub fn by(&self) -> &[String] {
        &self.by
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Groups with their key cells, sorted by key.
    pub fn groups(&self) -> Vec<(Vec<Cell>, Vec<&Row>)> {
        let positions: Vec<usize> = self
            .by
            .iter()
            .filter_map(|column| self.frame.column(column).ok())
            .collect();

        let mut index: HashMap<String, usize> = HashMap::new();
        let mut groups: Vec<(Vec<Cell>, Vec<&Row>)> = Vec::new();

        for row in self.frame.rows() {
            let key: Vec<Cell> = positions.iter().map(|&at| row.cells[at].clone()).collect();
            // Cells are not hashable, their JSON text is.
            let text = Cell::Array(key.clone()).to_string();

            match index.get(&text) {
                Some(&at) => groups[at].1.push(row),
                None => {
                    index.insert(text, groups.len());
                    groups.push((key, vec![row]));
                }
            }
        }

        groups.sort_by(|(a, _), (b, _)| {
            a.iter()
                .zip(b)
                .map(|(a, b)| compare_cells(a, b).unwrap_or_else(|| a.to_string().cmp(&b.to_string())))
                .find(|ordering| ordering.is_ne())
                .unwrap_or(Ordering::Equal)
        });

        groups
    }
}

/// The values flowing between tasks when running on tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Value {
    Table(Frame),
    Grouped(Grouped),
}

impl Value {
    pub fn as_table(&self) -> Option<&Frame> {
        match self {
            Value::Table(frame) => Some(frame),
            Value::Grouped(_) => None,
        }
    }
}

impl From<Frame> for Value {
    fn from(frame: Frame) -> Self {
        Value::Table(frame)
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Table(frame) => write!(f, "{frame}"),
            Value::Grouped(grouped) => {
                writeln!(
                    f,
                    "{} groups by {} over {} rows",
                    grouped.groups().len(),
                    grouped.by.join(", "),
                    grouped.frame.len()
                )
            }
        }
    }
}

impl Mergeable for Value {
    fn shape(&self) -> Shape {
        match self {
            Value::Table(_) => Shape::Table,
            Value::Grouped(_) => Shape::Grouped,
        }
    }

    /// Rows of the first table whose id appears in every other table. Tables
    /// with different columns do not describe the same rows and are not
    /// intersected.
    fn intersect(inputs: &[&Self]) -> Option<Self> {
        let tables: Vec<&Frame> = inputs
            .iter()
            .map(|value| value.as_table())
            .collect::<Option<_>>()?;

        let (first, rest) = tables.split_first()?;
        if rest.iter().any(|table| table.columns != first.columns) {
            return None;
        }

        let others: Vec<std::collections::HashSet<u64>> = rest
            .iter()
            .map(|table| table.rows.iter().map(|row| row.id).collect())
            .collect();

        Some(Value::Table(
            first.select(|row| others.iter().all(|ids| ids.contains(&row.id))),
        ))
    }
}
