//! Domain types for FundLab

pub mod filing;
pub mod slice;
pub mod ticker;
pub mod ticker_date;

pub use filing::{line_items, FilingKey, FilingPair, FinancialFiling};
pub use slice::{monthly_schedule, ScheduleError, TimeSlice};
pub use ticker::Ticker;
pub use ticker_date::{PricePoint, TickerDate};
