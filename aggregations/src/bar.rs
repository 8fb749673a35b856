/// Aggregated statistics for one UTC clock hour.
///
/// Mutated by [`HourlyBar::add_trade`] until the hour's month is
/// checkpointed; [`HourlyBar::finalize`] derives VWAP and the
/// volume-weighted price standard deviation from the running accumulators.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HourlyBar {
    pub buy_vol: f64,
    pub sell_vol: f64,

    pub n_trades: u64,
    pub buy_count: u64,
    pub sell_count: u64,

    pub whale_buy_vol_p99: f64,
    pub whale_sell_vol_p99: f64,
    pub whale_buy_count_p99: u64,
    pub whale_sell_count_p99: u64,

    pub whale_buy_vol_p999: f64,
    pub whale_sell_vol_p999: f64,
    pub whale_buy_count_p999: u64,
    pub whale_sell_count_p999: u64,

    pub vol_first_30min: f64,
    pub vol_last_30min: f64,

    pub buy_vol_usd: f64,
    pub sell_vol_usd: f64,

    pub max_trade_size: f64,
    pub vwap: f64,
    pub price_std: f64,

    // Accumulators for VWAP and price std; never serialized.
    sum_price_qty: f64,
    sum_qty: f64,
    sum_price_sq_qty: f64,
}

impl HourlyBar {
    pub fn add_trade(
        &mut self,
        price: f64,
        qty: f64,
        is_buy: bool,
        minute: u32,
        is_whale_p99: bool,
        is_whale_p999: bool,
    ) {
        let dollar_vol = price * qty;

        if is_buy {
            self.buy_vol += qty;
            self.buy_count += 1;
            self.buy_vol_usd += dollar_vol;
        } else {
            self.sell_vol += qty;
            self.sell_count += 1;
            self.sell_vol_usd += dollar_vol;
        }
        self.n_trades += 1;

        if is_whale_p99 {
            if is_buy {
                self.whale_buy_vol_p99 += qty;
                self.whale_buy_count_p99 += 1;
            } else {
                self.whale_sell_vol_p99 += qty;
                self.whale_sell_count_p99 += 1;
            }
        }
        if is_whale_p999 {
            if is_buy {
                self.whale_buy_vol_p999 += qty;
                self.whale_buy_count_p999 += 1;
            } else {
                self.whale_sell_vol_p999 += qty;
                self.whale_sell_count_p999 += 1;
            }
        }

        if minute < 30 {
            self.vol_first_30min += qty;
        } else {
            self.vol_last_30min += qty;
        }

        if qty > self.max_trade_size {
            self.max_trade_size = qty;
        }

        self.sum_price_qty += price * qty;
        self.sum_qty += qty;
        self.sum_price_sq_qty += price * price * qty;
    }

    /// Computes VWAP and price std; call once all trades for the hour have
    /// been added.
    pub fn finalize(&mut self) {
        if self.sum_qty > 0.0 {
            self.vwap = self.sum_price_qty / self.sum_qty;
            let variance = (self.sum_price_sq_qty / self.sum_qty) - self.vwap * self.vwap;
            self.price_std = variance.max(0.0).sqrt();
        }
    }

    /// Folds another bar for the same hour into this one.
    pub fn merge(&mut self, other: &HourlyBar) {
        self.buy_vol += other.buy_vol;
        self.sell_vol += other.sell_vol;
        self.n_trades += other.n_trades;
        self.buy_count += other.buy_count;
        self.sell_count += other.sell_count;

        self.whale_buy_vol_p99 += other.whale_buy_vol_p99;
        self.whale_sell_vol_p99 += other.whale_sell_vol_p99;
        self.whale_buy_count_p99 += other.whale_buy_count_p99;
        self.whale_sell_count_p99 += other.whale_sell_count_p99;

        self.whale_buy_vol_p999 += other.whale_buy_vol_p999;
        self.whale_sell_vol_p999 += other.whale_sell_vol_p999;
        self.whale_buy_count_p999 += other.whale_buy_count_p999;
        self.whale_sell_count_p999 += other.whale_sell_count_p999;

        self.vol_first_30min += other.vol_first_30min;
        self.vol_last_30min += other.vol_last_30min;

        self.buy_vol_usd += other.buy_vol_usd;
        self.sell_vol_usd += other.sell_vol_usd;

        if other.max_trade_size > self.max_trade_size {
            self.max_trade_size = other.max_trade_size;
        }

        self.sum_price_qty += other.sum_price_qty;
        self.sum_qty += other.sum_qty;
        self.sum_price_sq_qty += other.sum_price_sq_qty;
    }

    pub fn total_volume(&self) -> f64 {
        self.buy_vol + self.sell_vol
    }

    pub fn net_volume(&self) -> f64 {
        self.buy_vol - self.sell_vol
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_buy_trade() {
        let mut bar = HourlyBar::default();
        bar.add_trade(30_000.0, 0.5, true, 0, false, false);
        bar.finalize();

        assert_eq!(bar.buy_vol, 0.5);
        assert_eq!(bar.sell_vol, 0.0);
        assert_eq!(bar.n_trades, 1);
        assert_eq!(bar.buy_count, 1);
        assert_eq!(bar.vwap, 30_000.0);
        assert_eq!(bar.price_std, 0.0);
        assert_eq!(bar.vol_first_30min, 0.5);
        assert_eq!(bar.vol_last_30min, 0.0);
        assert_eq!(bar.max_trade_size, 0.5);
        assert_eq!(bar.buy_vol_usd, 15_000.0);
    }

    #[test]
    fn buy_and_sell_across_both_halves() {
        let mut bar = HourlyBar::default();
        bar.add_trade(30_000.0, 1.0, true, 5, false, false);
        bar.add_trade(31_000.0, 1.0, false, 45, false, false);
        bar.finalize();

        assert_eq!(bar.buy_vol, 1.0);
        assert_eq!(bar.sell_vol, 1.0);
        assert_eq!(bar.vol_first_30min, 1.0);
        assert_eq!(bar.vol_last_30min, 1.0);
        assert_eq!(bar.vwap, 30_500.0);
        assert!((bar.price_std - 500.0).abs() < 1e-6);
        assert_eq!(bar.max_trade_size, 1.0);
    }

    #[test]
    fn whale_counts_nest_inside_side_counts() {
        let mut bar = HourlyBar::default();
        bar.add_trade(100.0, 10.0, true, 10, true, true);
        bar.add_trade(100.0, 5.0, true, 10, true, false);
        bar.add_trade(100.0, 1.0, true, 10, false, false);
        bar.add_trade(100.0, 8.0, false, 40, true, false);

        assert!(bar.buy_count >= bar.whale_buy_count_p99);
        assert!(bar.whale_buy_count_p99 >= bar.whale_buy_count_p999);
        assert!(bar.sell_count >= bar.whale_sell_count_p99);
        assert!(bar.whale_sell_count_p99 >= bar.whale_sell_count_p999);
        assert_eq!(bar.whale_buy_vol_p99, 15.0);
        assert_eq!(bar.whale_buy_vol_p999, 10.0);
        assert_eq!(bar.whale_sell_vol_p99, 8.0);
        assert_eq!(bar.n_trades, bar.buy_count + bar.sell_count);
    }

    #[test]
    fn half_hour_split_sums_to_total_volume() {
        let mut bar = HourlyBar::default();
        for minute in 0..60 {
            bar.add_trade(50.0, 0.1, minute % 2 == 0, minute, false, false);
        }
        let total = bar.vol_first_30min + bar.vol_last_30min;
        assert_eq!(total, bar.buy_vol + bar.sell_vol);
    }

    #[test]
    fn merge_matches_single_bar_accumulation() {
        let mut combined = HourlyBar::default();
        combined.add_trade(10.0, 1.0, true, 3, false, false);
        combined.add_trade(20.0, 2.0, false, 33, true, false);
        combined.finalize();

        let mut left = HourlyBar::default();
        left.add_trade(10.0, 1.0, true, 3, false, false);
        let mut right = HourlyBar::default();
        right.add_trade(20.0, 2.0, false, 33, true, false);
        left.merge(&right);
        left.finalize();

        assert_eq!(left, combined);
        assert_eq!(left.total_volume(), 3.0);
        assert_eq!(left.net_volume(), -1.0);
    }

    #[test]
    fn finalize_on_empty_bar_is_a_no_op() {
        let mut bar = HourlyBar::default();
        bar.finalize();
        assert_eq!(bar.vwap, 0.0);
        assert_eq!(bar.price_std, 0.0);
    }
}
