//! Key namespace

use chrono::NaiveDate;

pub fn bias(symbol: &str) -> String {
    format!("bias:{}", symbol)
}

pub fn changes(symbol: &str) -> String {
    format!("changes:{}", symbol)
}

pub fn decisions(symbol: &str) -> String {
    format!("decisions:{}", symbol)
}

pub fn positions(symbol: &str) -> String {
    format!("positions:{}", symbol)
}

pub fn session(date: NaiveDate) -> String {
    format!("session:{}", date.format("%Y-%m-%d"))
}

/// Every key removed by a full symbol reset
pub fn symbol_keys(symbol: &str) -> [String; 4] {
    [
        bias(symbol),
        changes(symbol),
        decisions(symbol),
        positions(symbol),
    ]
}
