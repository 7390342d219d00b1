//! Global constants for susp-core

/// Conversion from model length units (mm) to metres
pub const MM_TO_M: f64 = 1e-3;

/// Standard gravity in m/s^2
pub const STANDARD_GRAVITY: f64 = 9.81;

/// Distance below which two node points are considered coincident (mm)
pub const COINCIDENT_EPSILON: f64 = 1e-6;

/// Current project file format version
pub const PROJECT_VERSION: u32 = 1;
