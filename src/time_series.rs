/// One `(t, value)` pair of a scalar signal, `t` in seconds since the trial baseline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeSeriesPoint {
    pub t: f64,
    pub value: f64,
}

impl TimeSeriesPoint {
    pub fn new(t: f64, value: f64) -> Self {
        Self { t, value }
    }
}

impl From<(f64, f64)> for TimeSeriesPoint {
    fn from(v: (f64, f64)) -> Self {
        TimeSeriesPoint { t: v.0, value: v.1 }
    }
}

impl From<TimeSeriesPoint> for (f64, f64) {
    fn from(p: TimeSeriesPoint) -> Self {
        (p.t, p.value)
    }
}
