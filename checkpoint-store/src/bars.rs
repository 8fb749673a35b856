use aggregations::{HourlyBar, HourlyRecord};
use chrono::DateTime;
use serde::{Deserialize, Serialize};

/// Compact on-disk form of one hourly bar (`bars/<YYYY-MM>.json` entries).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SerializedBar {
    /// Hour start, Unix seconds UTC.
    pub t: i64,

    pub bv: f64,
    pub sv: f64,

    pub nt: u64,
    pub bc: u64,
    pub sc: u64,

    pub wbv99: f64,
    pub wsv99: f64,
    pub wbc99: u64,
    pub wsc99: u64,

    pub wbv999: f64,
    pub wsv999: f64,
    pub wbc999: u64,
    pub wsc999: u64,

    pub vf30: f64,
    pub vl30: f64,

    pub bvu: f64,
    pub svu: f64,

    pub mts: f64,
    pub vwap: f64,
    pub pstd: f64,
}

impl From<&HourlyRecord> for SerializedBar {
    fn from(record: &HourlyRecord) -> Self {
        let bar = &record.bar;
        Self {
            t: record.time.timestamp(),
            bv: bar.buy_vol,
            sv: bar.sell_vol,
            nt: bar.n_trades,
            bc: bar.buy_count,
            sc: bar.sell_count,
            wbv99: bar.whale_buy_vol_p99,
            wsv99: bar.whale_sell_vol_p99,
            wbc99: bar.whale_buy_count_p99,
            wsc99: bar.whale_sell_count_p99,
            wbv999: bar.whale_buy_vol_p999,
            wsv999: bar.whale_sell_vol_p999,
            wbc999: bar.whale_buy_count_p999,
            wsc999: bar.whale_sell_count_p999,
            vf30: bar.vol_first_30min,
            vl30: bar.vol_last_30min,
            bvu: bar.buy_vol_usd,
            svu: bar.sell_vol_usd,
            mts: bar.max_trade_size,
            vwap: bar.vwap,
            pstd: bar.price_std,
        }
    }
}

impl SerializedBar {
    pub fn to_record(&self) -> HourlyRecord {
        let mut bar = HourlyBar::default();
        bar.buy_vol = self.bv;
        bar.sell_vol = self.sv;
        bar.n_trades = self.nt;
        bar.buy_count = self.bc;
        bar.sell_count = self.sc;
        bar.whale_buy_vol_p99 = self.wbv99;
        bar.whale_sell_vol_p99 = self.wsv99;
        bar.whale_buy_count_p99 = self.wbc99;
        bar.whale_sell_count_p99 = self.wsc99;
        bar.whale_buy_vol_p999 = self.wbv999;
        bar.whale_sell_vol_p999 = self.wsv999;
        bar.whale_buy_count_p999 = self.wbc999;
        bar.whale_sell_count_p999 = self.wsc999;
        bar.vol_first_30min = self.vf30;
        bar.vol_last_30min = self.vl30;
        bar.buy_vol_usd = self.bvu;
        bar.sell_vol_usd = self.svu;
        bar.max_trade_size = self.mts;
        bar.vwap = self.vwap;
        bar.price_std = self.pstd;
        HourlyRecord {
            time: DateTime::from_timestamp(self.t, 0).unwrap_or(DateTime::UNIX_EPOCH),
            bar,
        }
    }
}
