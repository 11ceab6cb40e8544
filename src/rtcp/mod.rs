//! RTCP control plane
//!
//! Sender/receiver reports, NTP timestamp handling, loss accounting,
//! link metering, and the capture-timestamp mapping derived from
//! sender reports.

mod link_meter;
mod loss;
pub mod ntp;
mod reports;

pub use link_meter::{LinkMeter, LinkMeterConfig, LinkMetrics};
pub use loss::{LossEstimator, PacketCounter};
pub use ntp::{ntp_from_unix_ns, ntp_to_unix_ns, NtpTimestamp};
pub use reports::{
    build_receiver_report, build_sender_report, parse_receiver_report,
    parse_sender_report, rtt_from_report, ReceiverReport, ReceiverReporter,
    ReceptionReport, SenderReport, TimestampMapping, PT_RECEIVER_REPORT,
    PT_SENDER_REPORT,
};
