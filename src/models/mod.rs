pub mod results;
pub mod site;
pub mod weather;
