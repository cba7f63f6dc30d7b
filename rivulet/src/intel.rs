//! Stream intel: per-phase timing and byte counters for a stream.
//!
//! [`StreamIntel`] is the small snapshot attached to every event.
//! [`FinalStreamIntel`] is the full record, finalized when the stream reaches
//! a terminal state and delivered with the terminal event.

use std::fmt;

use crate::clock::Millis;

/// Snapshot attached to every stream event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamIntel {
    pub stream_id: u64,
    /// Connection carrying the exchange, once one has been assigned.
    pub connection_id: Option<u64>,
    /// Number of connections the exchange has been assigned to.
    pub attempt_count: u32,
    /// Wire bytes received from the response at the time of the snapshot.
    pub consumed_bytes_from_response: u64,
}

/// Timestamped phases of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    StreamStart,
    DnsStart,
    DnsEnd,
    ConnectStart,
    ConnectEnd,
    SslStart,
    SslEnd,
    SendingStart,
    SendingEnd,
    ResponseStart,
    StreamEnd,
}

impl Phase {
    pub const ALL: [Phase; 11] = [
        Phase::StreamStart,
        Phase::DnsStart,
        Phase::DnsEnd,
        Phase::ConnectStart,
        Phase::ConnectEnd,
        Phase::SslStart,
        Phase::SslEnd,
        Phase::SendingStart,
        Phase::SendingEnd,
        Phase::ResponseStart,
        Phase::StreamEnd,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Phase::StreamStart => "stream_start",
            Phase::DnsStart => "dns_start",
            Phase::DnsEnd => "dns_end",
            Phase::ConnectStart => "connect_start",
            Phase::ConnectEnd => "connect_end",
            Phase::SslStart => "ssl_start",
            Phase::SslEnd => "ssl_end",
            Phase::SendingStart => "sending_start",
            Phase::SendingEnd => "sending_end",
            Phase::ResponseStart => "response_start",
            Phase::StreamEnd => "stream_end",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Phases recorded as start/end pairs. A finalized record holds both or neither.
const PAIRS: [(Phase, Phase); 4] = [
    (Phase::DnsStart, Phase::DnsEnd),
    (Phase::ConnectStart, Phase::ConnectEnd),
    (Phase::SslStart, Phase::SslEnd),
    (Phase::SendingStart, Phase::SendingEnd),
];

/// `a <= b` whenever both are present.
const ORDERING: [(Phase, Phase); 10] = [
    (Phase::DnsStart, Phase::DnsEnd),
    (Phase::DnsEnd, Phase::ConnectStart),
    (Phase::ConnectStart, Phase::SslStart),
    (Phase::SslStart, Phase::SslEnd),
    (Phase::SslEnd, Phase::ConnectEnd),
    (Phase::ConnectStart, Phase::ConnectEnd),
    (Phase::ConnectEnd, Phase::SendingStart),
    (Phase::SendingStart, Phase::SendingEnd),
    (Phase::ResponseStart, Phase::StreamEnd),
    (Phase::StreamStart, Phase::StreamEnd),
];

/// Phases every completed exchange records.
const REQUIRED: [Phase; 7] = [
    Phase::StreamStart,
    Phase::ConnectStart,
    Phase::ConnectEnd,
    Phase::SendingStart,
    Phase::SendingEnd,
    Phase::ResponseStart,
    Phase::StreamEnd,
];

/// The finalized telemetry record for a stream.
///
/// `None` means the phase did not occur for this exchange: there was no name
/// resolution, the upstream is not TLS, or the stream ended before reaching
/// that phase. Use [`raw`](Self::raw) for the `-1` sentinel form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FinalStreamIntel {
    pub stream_start: Option<Millis>,
    pub dns_start: Option<Millis>,
    pub dns_end: Option<Millis>,
    pub connect_start: Option<Millis>,
    pub connect_end: Option<Millis>,
    pub ssl_start: Option<Millis>,
    pub ssl_end: Option<Millis>,
    pub sending_start: Option<Millis>,
    pub sending_end: Option<Millis>,
    pub response_start: Option<Millis>,
    pub stream_end: Option<Millis>,
    /// The exchange ran on a connection that carried an earlier exchange.
    pub socket_reused: bool,
    pub sent_byte_count: u64,
    pub received_byte_count: u64,
}

/// What a caller knows about an exchange, for [`FinalStreamIntel::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IntelExpectations {
    /// The authority was a host name, so resolution occurred.
    pub expect_dns: bool,
    pub upstream_tls: bool,
    /// The exchange was the first on its connection.
    pub first_on_connection: bool,
}

/// A broken telemetry invariant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntelViolation {
    #[error("{0} was not recorded")]
    Missing(Phase),

    #[error("{0} was recorded but did not occur")]
    Unexpected(Phase),

    #[error("{start} and {end} must be recorded together")]
    Unpaired { start: Phase, end: Phase },

    #[error("{earlier} ({earlier_at}) is later than {later} ({later_at})")]
    OutOfOrder {
        earlier: Phase,
        earlier_at: Millis,
        later: Phase,
        later_at: Millis,
    },

    #[error("{0} must be greater than zero")]
    NotPositive(Phase),
}

impl FinalStreamIntel {
    pub fn get(&self, phase: Phase) -> Option<Millis> {
        match phase {
            Phase::StreamStart => self.stream_start,
            Phase::DnsStart => self.dns_start,
            Phase::DnsEnd => self.dns_end,
            Phase::ConnectStart => self.connect_start,
            Phase::ConnectEnd => self.connect_end,
            Phase::SslStart => self.ssl_start,
            Phase::SslEnd => self.ssl_end,
            Phase::SendingStart => self.sending_start,
            Phase::SendingEnd => self.sending_end,
            Phase::ResponseStart => self.response_start,
            Phase::StreamEnd => self.stream_end,
        }
    }

    pub(crate) fn slot_mut(&mut self, phase: Phase) -> &mut Option<Millis> {
        match phase {
            Phase::StreamStart => &mut self.stream_start,
            Phase::DnsStart => &mut self.dns_start,
            Phase::DnsEnd => &mut self.dns_end,
            Phase::ConnectStart => &mut self.connect_start,
            Phase::ConnectEnd => &mut self.connect_end,
            Phase::SslStart => &mut self.ssl_start,
            Phase::SslEnd => &mut self.ssl_end,
            Phase::SendingStart => &mut self.sending_start,
            Phase::SendingEnd => &mut self.sending_end,
            Phase::ResponseStart => &mut self.response_start,
            Phase::StreamEnd => &mut self.stream_end,
        }
    }

    /// Record `phase` unless it already holds a value. Returns true if recorded.
    pub(crate) fn record_once(&mut self, phase: Phase, at: Millis) -> bool {
        let slot = self.slot_mut(phase);
        if slot.is_some() {
            return false;
        }
        *slot = Some(at);
        true
    }

    /// Timestamp in the legacy sentinel form: milliseconds, or `-1` if the
    /// phase did not occur.
    pub fn raw(&self, phase: Phase) -> i64 {
        self.get(phase).map_or(-1, |m| m.as_u64() as i64)
    }

    /// Check pairing and ordering of whatever phases are present.
    ///
    /// These hold for every finalized record, including streams that were
    /// cancelled or failed before reaching every phase.
    pub fn check_invariants(&self) -> Result<(), IntelViolation> {
        for (start, end) in PAIRS {
            if self.get(start).is_some() != self.get(end).is_some() {
                return Err(IntelViolation::Unpaired { start, end });
            }
        }
        for (earlier, later) in ORDERING {
            self.ordered(earlier, later)?;
        }
        Ok(())
    }

    /// Full validation of a completed exchange against what the caller
    /// knows about it.
    pub fn validate(&self, expect: &IntelExpectations) -> Result<(), IntelViolation> {
        self.check_invariants()?;

        for phase in REQUIRED {
            if self.get(phase).is_none() {
                return Err(IntelViolation::Missing(phase));
            }
        }

        self.expect_pair(Phase::DnsStart, Phase::DnsEnd, expect.expect_dns)?;
        self.expect_pair(Phase::SslStart, Phase::SslEnd, expect.upstream_tls)?;
        if expect.upstream_tls {
            for phase in [Phase::SslStart, Phase::SslEnd] {
                if self.get(phase).is_some_and(|t| t.as_u64() == 0) {
                    return Err(IntelViolation::NotPositive(phase));
                }
            }
        }

        // Reused connections report the original handshake, which may
        // predate this stream.
        if expect.first_on_connection {
            self.ordered(Phase::StreamStart, Phase::ConnectStart)?;
        }
        Ok(())
    }

    fn ordered(&self, earlier: Phase, later: Phase) -> Result<(), IntelViolation> {
        if let (Some(earlier_at), Some(later_at)) = (self.get(earlier), self.get(later))
            && earlier_at > later_at
        {
            return Err(IntelViolation::OutOfOrder {
                earlier,
                earlier_at,
                later,
                later_at,
            });
        }
        Ok(())
    }

    fn expect_pair(&self, start: Phase, end: Phase, present: bool) -> Result<(), IntelViolation> {
        for phase in [start, end] {
            match (self.get(phase).is_some(), present) {
                (false, true) => return Err(IntelViolation::Missing(phase)),
                (true, false) => return Err(IntelViolation::Unexpected(phase)),
                _ => {}
            }
        }
        Ok(())
    }
}
