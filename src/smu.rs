//! Source-measure unit: analog stage drivers, calibration, drive sequencing
//! and the host command protocol.

pub mod analog;
pub mod calibration;
pub mod mcp3201;
pub mod mcp4921;
pub mod nvconfig;
pub mod protocol;
