//! The hardware module contains the channel implementations the reflash engine can run on.
//!
//! * [pwm] - A J1850 PWM [crate::channel::PwmChannel] for any device able to send and receive raw frames
//! * [router] - Receive side of [pwm]: dispatches raw frames to waiting callers
//! * [simulation] - An in-memory powertrain controller, for bench testing without a vehicle

pub mod pwm;
pub mod router;
pub mod simulation;
