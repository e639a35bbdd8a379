//! Per-connection TCP state machine.
//!
//! Eleven states driven by a flag-derived input symbol and a direction
//! offset, through one of two transition tables: the normal table and a
//! secure table biased toward earlier termination under suspected attack.
//! The tables encode this balancer's interpretation of TCP, including the
//! SYN-proxy SYNACK rows, and are reproduced exactly.

use std::time::Duration;

use tracing::debug;

use crate::config::TimeoutConfig;
use crate::dataplane::conn::{Conn, ConnFlags};
use crate::framework::Direction;
use crate::protocol::tcp::TcpFlags;
use crate::{Error, Result};

/// Connection states. Variant order is the table column order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    None = 0,
    Established = 1,
    SynSent = 2,
    SynRecv = 3,
    FinWait = 4,
    TimeWait = 5,
    Close = 6,
    CloseWait = 7,
    LastAck = 8,
    Listen = 9,
    /// SYN|ACK observed through the SYN proxy.
    SynAck = 10,
}

impl TcpState {
    pub const COUNT: usize = 11;

    pub fn name(self) -> &'static str {
        match self {
            TcpState::None => "NONE",
            TcpState::Established => "ESTABLISHED",
            TcpState::SynSent => "SYN_SENT",
            TcpState::SynRecv => "SYN_RECV",
            TcpState::FinWait => "FIN_WAIT",
            TcpState::TimeWait => "TIME_WAIT",
            TcpState::Close => "CLOSE",
            TcpState::CloseWait => "CLOSE_WAIT",
            TcpState::LastAck => "LAST_ACK",
            TcpState::Listen => "LISTEN",
            TcpState::SynAck => "SYNACK",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "NONE" => Ok(TcpState::None),
            "ESTABLISHED" => Ok(TcpState::Established),
            "SYN_SENT" => Ok(TcpState::SynSent),
            "SYN_RECV" => Ok(TcpState::SynRecv),
            "FIN_WAIT" => Ok(TcpState::FinWait),
            "TIME_WAIT" => Ok(TcpState::TimeWait),
            "CLOSE" => Ok(TcpState::Close),
            "CLOSE_WAIT" => Ok(TcpState::CloseWait),
            "LAST_ACK" => Ok(TcpState::LastAck),
            "LISTEN" => Ok(TcpState::Listen),
            "SYNACK" => Ok(TcpState::SynAck),
            _ => Err(Error::UnknownState(name.to_string())),
        }
    }
}

// Short aliases so the tables read like the protocol charts they come from.
const SNO: TcpState = TcpState::None;
const SES: TcpState = TcpState::Established;
const SSS: TcpState = TcpState::SynSent;
const SSR: TcpState = TcpState::SynRecv;
const SFW: TcpState = TcpState::FinWait;
const STW: TcpState = TcpState::TimeWait;
const SCL: TcpState = TcpState::Close;
const SCW: TcpState = TcpState::CloseWait;
const SLA: TcpState = TcpState::LastAck;
const SLI: TcpState = TcpState::Listen;
const SSA: TcpState = TcpState::SynAck;

const DIR_INPUT: usize = 0;
const DIR_OUTPUT: usize = 4;
const DIR_INPUT_ONLY: usize = 8;

/// Row = direction offset + input symbol, column = current state.
type StateTable = [[TcpState; TcpState::COUNT]; 12];

#[rustfmt::skip]
static TCP_STATES: StateTable = [
    // INPUT
    //     sNO  sES  sSS  sSR  sFW  sTW  sCL  sCW  sLA  sLI  sSA
    /*syn*/[SSR, SES, SES, SSR, SSR, SSR, SSR, SSR, SSR, SSR, SSR],
    /*fin*/[SCL, SCW, SSS, STW, STW, STW, SCL, SCW, SLA, SLI, STW],
    /*ack*/[SCL, SES, SSS, SES, SFW, STW, SCL, SCW, SCL, SLI, SES],
    /*rst*/[SCL, SCL, SCL, SSR, SCL, SCL, SCL, SCL, SLA, SLI, SSR],

    // OUTPUT
    //     sNO  sES  sSS  sSR  sFW  sTW  sCL  sCW  sLA  sLI  sSA
    /*syn*/[SSS, SES, SSS, SSR, SSS, SSS, SSS, SSS, SSS, SLI, SSR],
    /*fin*/[STW, SFW, SSS, STW, SFW, STW, SCL, STW, SLA, SLI, STW],
    /*ack*/[SES, SES, SSS, SES, SFW, STW, SCL, SCW, SLA, SES, SES],
    /*rst*/[SCL, SCL, SSS, SCL, SCL, STW, SCL, SCL, SCL, SCL, SCL],

    // INPUT-ONLY
    //     sNO  sES  sSS  sSR  sFW  sTW  sCL  sCW  sLA  sLI  sSA
    /*syn*/[SSR, SES, SES, SSR, SSR, SSR, SSR, SSR, SSR, SSR, SSR],
    /*fin*/[SCL, SFW, SSS, STW, SFW, STW, SCL, SCW, SLA, SLI, STW],
    /*ack*/[SCL, SES, SSS, SES, SFW, STW, SCL, SCW, SCL, SLI, SES],
    /*rst*/[SCL, SCL, SCL, SSR, SCL, SCL, SCL, SCL, SLA, SLI, SCL],
];

#[rustfmt::skip]
static TCP_STATES_SECURE: StateTable = [
    // INPUT
    //     sNO  sES  sSS  sSR  sFW  sTW  sCL  sCW  sLA  sLI  sSA
    /*syn*/[SSR, SES, SES, SSR, SSR, SSR, SSR, SSR, SSR, SSR, SSA],
    /*fin*/[SCL, SCW, SSS, STW, STW, STW, SCL, SCW, SLA, SLI, SSA],
    /*ack*/[SCL, SES, SSS, SSR, SFW, STW, SCL, SCW, SCL, SLI, SSA],
    /*rst*/[SCL, SCL, SCL, SSR, SCL, SCL, SCL, SCL, SLA, SLI, SCL],

    // OUTPUT
    //     sNO  sES  sSS  sSR  sFW  sTW  sCL  sCW  sLA  sLI  sSA
    /*syn*/[SSS, SES, SSS, SSA, SSS, SSS, SSS, SSS, SSS, SLI, SSA],
    /*fin*/[STW, SFW, SSS, STW, SFW, STW, SCL, STW, SLA, SLI, STW],
    /*ack*/[SES, SES, SSS, SES, SFW, STW, SCL, SCW, SLA, SES, SES],
    /*rst*/[SCL, SCL, SSS, SCL, SCL, STW, SCL, SCL, SCL, SCL, SCL],

    // INPUT-ONLY
    //     sNO  sES  sSS  sSR  sFW  sTW  sCL  sCW  sLA  sLI  sSA
    /*syn*/[SSA, SES, SES, SSR, SSA, SSA, SSA, SSA, SSA, SSA, SSA],
    /*fin*/[SCL, SFW, SSS, STW, SFW, STW, SCL, SCW, SLA, SLI, STW],
    /*ack*/[SCL, SES, SSS, SES, SFW, STW, SCL, SCW, SCL, SLI, SES],
    /*rst*/[SCL, SCL, SCL, SSR, SCL, SCL, SCL, SCL, SLA, SLI, SCL],
];

/// Input symbol from flags, priority RST > SYN > FIN > ACK. Any other
/// combination drives no transition.
pub(crate) fn state_symbol(flags: TcpFlags) -> Option<usize> {
    if flags.rst {
        Some(3)
    } else if flags.syn {
        Some(0)
    } else if flags.fin {
        Some(1)
    } else if flags.ack {
        Some(2)
    } else {
        None
    }
}

/// Pure table lookup: next state for (table, direction offset, symbol,
/// current state).
fn next_state(secure: bool, row: usize, current: TcpState) -> TcpState {
    let table = if secure { &TCP_STATES_SECURE } else { &TCP_STATES };
    table[row][current as usize]
}

/// Per-state idle timeouts.
#[derive(Debug, Clone)]
pub struct TimeoutTable([Duration; TcpState::COUNT]);

impl TimeoutTable {
    pub fn from_config(config: &TimeoutConfig) -> Self {
        let mut table = [Duration::ZERO; TcpState::COUNT];
        table[TcpState::None as usize] = Duration::from_secs(config.none);
        table[TcpState::Established as usize] = Duration::from_secs(config.established);
        table[TcpState::SynSent as usize] = Duration::from_secs(config.syn_sent);
        table[TcpState::SynRecv as usize] = Duration::from_secs(config.syn_recv);
        table[TcpState::FinWait as usize] = Duration::from_secs(config.fin_wait);
        table[TcpState::TimeWait as usize] = Duration::from_secs(config.time_wait);
        table[TcpState::Close as usize] = Duration::from_secs(config.close);
        table[TcpState::CloseWait as usize] = Duration::from_secs(config.close_wait);
        table[TcpState::LastAck as usize] = Duration::from_secs(config.last_ack);
        table[TcpState::Listen as usize] = Duration::from_secs(config.listen);
        table[TcpState::SynAck as usize] = Duration::from_secs(config.synack);
        Self(table)
    }

    pub fn get(&self, state: TcpState) -> Duration {
        self.0[state as usize]
    }

    /// Override one entry by state name.
    pub fn set_by_name(&mut self, name: &str, timeout: Duration) -> Result<()> {
        let state = TcpState::from_name(name)?;
        self.0[state as usize] = timeout;
        Ok(())
    }
}

impl Default for TimeoutTable {
    fn default() -> Self {
        Self::from_config(&TimeoutConfig::default())
    }
}

/// Drive one transition attempt under the connection lock.
///
/// Chooses the direction offset (downgrading INPUT to INPUT-ONLY while the
/// connection has produced no output, and clearing NO_OUTPUT once output is
/// seen), derives the input symbol, and applies the table. Crossing the
/// ESTABLISHED boundary adjusts the bound destination's counters; the
/// timeout is rearmed from the table on every valid symbol.
pub(crate) fn apply_transition(
    conn: &Conn,
    direction: Direction,
    flags: TcpFlags,
    secure: bool,
    timeouts: &TimeoutTable,
) {
    let mut tcb = conn.tcb_lock();

    let mut offset = match direction {
        Direction::Input => DIR_INPUT,
        Direction::Output => DIR_OUTPUT,
        Direction::InputOnly => DIR_INPUT_ONLY,
    };

    if conn.has_flag(ConnFlags::NO_OUTPUT) {
        if offset == DIR_OUTPUT {
            conn.clear_flag(ConnFlags::NO_OUTPUT);
        } else {
            offset = DIR_INPUT_ONLY;
        }
    }

    let Some(symbol) = state_symbol(flags) else {
        return;
    };

    let new_state = next_state(secure, offset + symbol, tcb.state);

    if new_state != tcb.state {
        debug!(
            from = tcb.state.name(),
            to = new_state.name(),
            output = offset == DIR_OUTPUT,
            "tcp state transition"
        );

        if let Some(dest) = conn.dest() {
            if !conn.has_flag(ConnFlags::INACTIVE) && new_state != TcpState::Established {
                dest.active_conns.dec();
                dest.inactive_conns.inc();
                conn.set_flag(ConnFlags::INACTIVE);
            } else if conn.has_flag(ConnFlags::INACTIVE) && new_state == TcpState::Established {
                dest.active_conns.inc();
                dest.inactive_conns.dec();
                conn.clear_flag(ConnFlags::INACTIVE);
            }
        }
    }

    tcb.old_state = tcb.state;
    tcb.state = new_state;
    tcb.timeout = timeouts.get(new_state);
}

/// Put a connection into LISTEN with the LISTEN timeout, under the
/// connection lock. Application helpers use this for expected peer
/// connections.
pub(crate) fn enter_listen(conn: &Conn, timeouts: &TimeoutTable) {
    let mut tcb = conn.tcb_lock();
    tcb.state = TcpState::Listen;
    tcb.timeout = timeouts.get(TcpState::Listen);
}
