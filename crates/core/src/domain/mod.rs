pub mod affinity;
pub mod customer;
pub mod matrix;
pub mod product;
pub mod tenant;
pub mod transaction;
