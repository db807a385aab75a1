pub mod ledger;
pub mod position_sizer;
pub mod profit_reserve;
pub mod risk_manager;

pub use ledger::PositionLedger;
pub use profit_reserve::ProfitReserve;
pub use risk_manager::{check_entry, PortfolioSnapshot, RiskLimits, RiskViolation};
