// onde-common: OT algebra, domain types and the wire protocol shared by the
// relay and its clients

pub mod ot;
pub mod protocol;
pub mod types;
