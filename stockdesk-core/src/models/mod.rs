pub mod quote;
pub mod report;
pub mod ticker;
pub mod turn;

pub use quote::{Fundamentals, Quote};
pub use report::{NewReport, Report};
pub use ticker::{KnownCompany, TickerMatch};
pub use turn::{DocumentRef, Role, Turn, PDF_MIME_TYPE};
