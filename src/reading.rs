/// One decoded TP357S observation.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub temperature_celsius: f64,
    pub temperature_fahrenheit: f64,
    pub humidity_percent: u8,
    pub raw_hex: String,
}
