pub mod helpers;
pub mod marketplace;
