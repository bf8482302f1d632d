//! Synthetic sales records, loosely shaped after a retail superstore export.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{Value, json};
use strata::frame::Frame;

const PRODUCTS: &[(&str, f64)] = &[
    ("Laptop", 800.0),
    ("Desktop", 1000.0),
    ("Tablet", 400.0),
    ("Smartphone", 600.0),
    ("Monitor", 300.0),
    ("Keyboard", 50.0),
    ("Mouse", 30.0),
    ("Printer", 200.0),
    ("Scanner", 150.0),
    ("Webcam", 80.0),
    ("Headphones", 100.0),
    ("Speakers", 150.0),
    ("Router", 100.0),
    ("Modem", 80.0),
    ("Hard Drive", 120.0),
];

const REGIONS: &[&str] = &["North", "South", "East", "West", "Central"];

const CATEGORIES: &[&str] = &[
    "Electronics",
    "Computers",
    "Accessories",
    "Networking",
    "Storage",
    "Audio",
];

const YEARS: &[i64] = &[2021, 2022, 2023, 2024];

const COLUMNS: &[&str] = &[
    "transaction_id",
    "product",
    "category",
    "region",
    "customer",
    "year",
    "month",
    "quantity",
    "unit_price",
    "revenue",
    "cost",
    "profit",
    "sales",
];

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn pick<'a, T>(rng: &mut StdRng, items: &'a [T]) -> &'a T {
    &items[rng.gen_range(0..items.len())]
}

/// Generates `records` rows from a fixed seed, sorted by year and month.
pub fn generate(records: usize, seed: u64) -> anyhow::Result<Frame> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut rows: Vec<(i64, i64, Vec<Value>)> = Vec::with_capacity(records);

    for n in 0..records {
        let (product, base_price) = *pick(&mut rng, PRODUCTS);
        let category = *pick(&mut rng, CATEGORIES);
        let region = *pick(&mut rng, REGIONS);
        let customer = format!("Customer_{:04}", rng.gen_range(1..=500));
        let year = *pick(&mut rng, YEARS);
        let month = rng.gen_range(1..=12_i64);

        let quantity = rng.gen_range(1..=100_i64);
        let unit_price = base_price * rng.gen_range(0.8..1.2);
        let revenue = quantity as f64 * unit_price;
        let cost = revenue * rng.gen_range(0.5..0.7);

        rows.push((
            year,
            month,
            vec![
                json!(format!("TXN{n:06}")),
                json!(product),
                json!(category),
                json!(region),
                json!(customer),
                json!(year),
                json!(month),
                json!(quantity),
                json!(round2(unit_price)),
                json!(round2(revenue)),
                json!(round2(cost)),
                json!(round2(revenue - cost)),
                json!(round2(revenue)),
            ],
        ));
    }

    rows.sort_by_key(|&(year, month, _)| (year, month));

    Ok(Frame::new(
        COLUMNS.iter().copied(),
        rows.into_iter().map(|(_, _, cells)| cells),
    )?)
}
