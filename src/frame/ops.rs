use std::cmp::Ordering;

use anyhow::Context;
use serde_json::{Number, Value as Cell};

use crate::frame::{Frame, FrameError, Grouped, Row, Value, compare_cells};
use crate::operator::{Input, Operator};
use crate::task::{Aggregation, Comparator, Condition, Operation, Task};

/// Runs filter, group, aggregate and fetch tasks on [`Value`]s.
///
/// A failed input is not recovered from: the task fails with the upstream
/// message, so failures travel to the end of the plan.
#[derive(Debug, Clone, Copy, Default)]
pub struct TableOperator;

impl Operator<Value> for TableOperator {
    fn apply(&self, task: &Task, input: Input<'_, Value>) -> anyhow::Result<Value> {
        let input = input.map_err(|failure| anyhow::anyhow!("Upstream failed: {failure}"))?;

        let output = match &task.operation {
            Operation::Filter { conditions } => filter(input, conditions).map(Value::Table),
            Operation::Group { by } => group(input, by),
            Operation::Aggregate { kind, field } => aggregate(input, *kind, field).map(Value::Table),
            Operation::Fetch | Operation::Other { .. } => Ok(input.clone()),
        };

        output.with_context(|| format!("Task {} ({})", task.id, task.operation.kind()))
    }
}

fn filter(input: &Value, conditions: &[Condition]) -> Result<Frame, FrameError> {
    let Value::Table(frame) = input else {
        return Err(FrameError::Grouped { operation: "filter" });
    };

    let checks = conditions
        .iter()
        .map(|condition| Ok((frame.column(&condition.field)?, condition)))
        .collect::<Result<Vec<_>, FrameError>>()?;

    Ok(frame.select(|row| {
        checks
            .iter()
            .all(|(at, condition)| matches(&row.cells[*at], condition.comparator, &condition.value))
    }))
}

fn matches(cell: &Cell, comparator: Comparator, value: &Cell) -> bool {
    let ordering = compare_cells(cell, value);

    match comparator {
        Comparator::Eq => ordering == Some(Ordering::Equal),
        Comparator::Ne => ordering != Some(Ordering::Equal),
        Comparator::Gt => ordering == Some(Ordering::Greater),
        Comparator::Lt => ordering == Some(Ordering::Less),
        Comparator::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
        Comparator::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
    }
}

fn group(input: &Value, by: &[String]) -> Result<Value, FrameError> {
    if by.is_empty() {
        return Ok(input.clone());
    }

    let frame = match input {
        Value::Table(frame) => frame,
        Value::Grouped(grouped) => grouped.frame(),
    };

    Ok(Value::Grouped(Grouped::new(by.to_vec(), frame.clone())?))
}

fn aggregate(input: &Value, kind: Aggregation, field: &str) -> Result<Frame, FrameError> {
    match input {
        Value::Table(frame) => {
            let at = frame.column(field)?;
            let rows: Vec<&Row> = frame.rows().iter().collect();

            let value = match kind {
                Aggregation::Count => Cell::from(rows.len()),
                kind => fold(kind, field, rows.iter().map(|row| &row.cells[at]))?,
            };

            Ok(Frame::from_parts(
                vec![field.to_owned()],
                vec![Row {
                    id: 0,
                    cells: vec![value],
                }],
            ))
        }
        Value::Grouped(grouped) => {
            let at = grouped.frame().column(field)?;

            let mut columns = grouped.by().to_vec();
            columns.push(field.to_owned());

            let rows = grouped
                .groups()
                .into_iter()
                .enumerate()
                .map(|(index, (mut key, rows))| {
                    let cells = rows.iter().map(|row| &row.cells[at]);
                    let value = match kind {
                        Aggregation::Count => Cell::from(cells.filter(|cell| !cell.is_null()).count()),
                        kind => fold(kind, field, cells)?,
                    };

                    key.push(value);
                    Ok(Row {
                        id: index as u64,
                        cells: key,
                    })
                })
                .collect::<Result<_, FrameError>>()?;

            Ok(Frame::from_parts(columns, rows))
        }
    }
}

/// Sum, mean, max or min over the non-null cells. Integer columns stay
/// integers except for the mean; an empty column sums to zero and has no
/// mean, max or min.
fn fold<'a>(
    kind: Aggregation,
    field: &str,
    cells: impl Iterator<Item = &'a Cell>,
) -> Result<Cell, FrameError> {
    let mut numbers: Vec<&Number> = Vec::new();
    for cell in cells {
        match cell {
            Cell::Null => {}
            Cell::Number(number) => numbers.push(number),
            other => {
                return Err(FrameError::NotNumeric {
                    column: field.to_owned(),
                    value: other.clone(),
                });
            }
        }
    }

    let integers: Option<Vec<i64>> = numbers.iter().map(|number| number.as_i64()).collect();
    let floats: Vec<f64> = numbers.iter().filter_map(|number| number.as_f64()).collect();

    let value = match (kind, integers) {
        // Integer totals past i64 fall back to a float sum.
        (Aggregation::Sum, Some(integers)) => integers
            .iter()
            .try_fold(0_i64, |total, &n| total.checked_add(n))
            .map_or_else(|| Cell::from(floats.iter().sum::<f64>()), Cell::from),
        (Aggregation::Max, Some(integers)) => integers.iter().max().map_or(Cell::Null, |&n| n.into()),
        (Aggregation::Min, Some(integers)) => integers.iter().min().map_or(Cell::Null, |&n| n.into()),
        (Aggregation::Sum, None) => Cell::from(floats.iter().sum::<f64>()),
        (Aggregation::Max, None) => floats.iter().copied().reduce(f64::max).map_or(Cell::Null, Cell::from),
        (Aggregation::Min, None) => floats.iter().copied().reduce(f64::min).map_or(Cell::Null, Cell::from),
        (Aggregation::Avg, _) if floats.is_empty() => Cell::Null,
        (Aggregation::Avg, _) => Cell::from(floats.iter().sum::<f64>() / floats.len() as f64),
        (Aggregation::Count, _) => Cell::from(floats.len()),
    };

    Ok(value)
}
