// Component B: control context
// Turns sector distances into pressure setpoints and drives one PI loop per pad,
// with a safety state machine overriding it whenever the target is lost.
pub mod controller;
pub mod setpoint;
pub mod safety;
pub mod hardware;
pub mod control_loop;
