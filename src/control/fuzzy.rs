//! Rule-table controller for profile authors who want smoother, less
//! oscillatory tracking than PID. No tuned gains and no learned state: the
//! table below is fixed.

use std::collections::VecDeque;

const LEVELS: usize = 5;

/// Output singletons per (error, error-rate) rule. Rows are error from
/// negative-large (actual far above target) to positive-large; columns are
/// error rate from falling fast to rising fast. Values are pump power.
const RULES: [[f64; LEVELS]; LEVELS] = [
    [0.00, 0.00, 0.00, 0.00, 0.25],
    [0.00, 0.00, 0.25, 0.25, 0.50],
    [0.00, 0.25, 0.50, 0.50, 0.75],
    [0.25, 0.50, 0.75, 0.75, 1.00],
    [0.50, 0.75, 1.00, 1.00, 1.00],
];

/// Membership centers on the normalized [-1, 1] axis.
const CENTERS: [f64; LEVELS] = [-1.0, -0.5, 0.0, 0.5, 1.0];
const HALF_WIDTH: f64 = 0.5;

/// Triangular membership grades of `x` against the five sets.
fn memberships(x: f64) -> [f64; LEVELS] {
    let mut m = [0.0; LEVELS];
    for (i, c) in CENTERS.iter().enumerate() {
        m[i] = (1.0 - (x - c).abs() / HALF_WIDTH).max(0.0);
    }
    m
}

/// Fuzzy control unit over (error, error-rate).
pub struct FuzzyUnit {
    /// Error magnitude that maps to full scale (target units).
    error_scale: f64,
    /// Error-rate magnitude that maps to full scale (target units / s).
    rate_scale: f64,
    history: VecDeque<f64>,
}

impl FuzzyUnit {
    pub fn new(error_scale: f64, rate_scale: f64) -> Self {
        Self {
            error_scale: error_scale.max(1e-6),
            rate_scale: rate_scale.max(1e-6),
            history: VecDeque::with_capacity(2),
        }
    }

    /// Pump power in [0, 1] for the current error. Deterministic for a given
    /// input sequence.
    pub fn command(&mut self, target: f64, actual: f64, dt: f64) -> f64 {
        let error = target - actual;
        let rate = match self.history.back() {
            Some(prev) => (error - prev) / dt.max(1e-6),
            None => 0.0,
        };
        if self.history.len() == 2 {
            self.history.pop_front();
        }
        self.history.push_back(error);

        let en = (error / self.error_scale).clamp(-1.0, 1.0);
        let rn = (rate / self.rate_scale).clamp(-1.0, 1.0);
        let me = memberships(en);
        let mr = memberships(rn);

        // Weighted-average defuzzification over the singleton outputs.
        let mut num = 0.0;
        let mut den = 0.0;
        for (i, &we) in me.iter().enumerate() {
            for (j, &wr) in mr.iter().enumerate() {
                let w = we * wr;
                num += w * RULES[i][j];
                den += w;
            }
        }
        if den > 0.0 {
            (num / den).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_error_holds_mid_power() {
        let mut f = FuzzyUnit::new(4.0, 4.0);
        let cmd = f.command(9.0, 9.0, 0.05);
        assert!((cmd - 0.5).abs() < 1e-9);
    }

    #[test]
    fn large_positive_error_drives_full_power() {
        let mut f = FuzzyUnit::new(4.0, 4.0);
        // First call has zero rate; error saturates the positive-large set.
        let cmd = f.command(9.0, 0.0, 0.05);
        assert!(cmd > 0.9, "cmd was {cmd}");
    }

    #[test]
    fn large_negative_error_cuts_power() {
        let mut f = FuzzyUnit::new(4.0, 4.0);
        let cmd = f.command(2.0, 12.0, 0.05);
        assert!(cmd < 0.1, "cmd was {cmd}");
    }

    #[test]
    fn output_stays_in_unit_range_over_a_sweep() {
        let mut f = FuzzyUnit::new(4.0, 4.0);
        let mut actual = 0.0;
        for _ in 0..200 {
            let cmd = f.command(9.0, actual, 0.05);
            assert!((0.0..=1.0).contains(&cmd));
            actual += (cmd - 0.3) * 0.5;
        }
    }
}
