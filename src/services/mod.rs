pub mod acquisition;
pub mod analysis;
pub mod enrichment;
pub mod local_time;
pub mod nsrdb;
pub mod pv_engine;
pub mod simulation;
pub mod site_selection;
pub mod snow_depth;
pub mod stitching;
