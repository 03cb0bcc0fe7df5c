pub mod boundary;
pub mod cell_value;
pub mod coordinate;
pub mod grid_builder;
pub mod normalizer;
pub mod region_builder;
pub mod value_store;
