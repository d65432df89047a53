pub const ROUTE_STATUS: &str = "/status";
pub const ROUTE_TEMPERATURE: &str = "/temperature";
pub const ROUTE_DISTANCE: &str = "/distance";
pub const ROUTE_TURBIDITY: &str = "/turbidity";
pub const ROUTE_TDS: &str = "/tds";
pub const ROUTE_ALL_SENSORS: &str = "/all_sensors";
pub const ROUTE_HARD_RESET: &str = "/hardreset";
