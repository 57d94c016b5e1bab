//! The control surface: commands that configure channels and drive
//! transfers, keyed by direction and operation.
//!
//! Commands can be built directly, or decoded from a numeric [`opcode`]
//! and a [`RawArg`] with [`Command::from_raw`]. Dispatch keeps four kinds of
//! failure apart:
//!
//! - [`ControlError::UnknownOp`]: the opcode means nothing,
//! - [`ControlError::NotApplicable`]: the operation exists but not in this
//!   direction,
//! - [`ControlError::NoChannel`]: the device has no channel in this
//!   direction,
//! - [`ControlError::Failed`]: the operation ran and failed.
use core::fmt;

use crate::{
    completion::{ErrorCode, Mode, NotifyOn},
    config::{ChannelParams, LoopbackParams},
    device::{Device, Properties},
    error::{ConfigError, Error},
    hal::{CoherentMemory, DeviceChannel, Registers},
    Direction,
};

/// Numeric operation codes.
pub mod opcode {
    pub const SETUP_RX_CHANNEL: u32 = 0x10;
    pub const RX_SINGLE: u32 = 0x11;
    pub const RX_BURST: u32 = 0x12;
    pub const RX_CONTINUOUS: u32 = 0x13;
    pub const RX_STOP: u32 = 0x14;
    pub const RX_GET_NEXT_INDEX: u32 = 0x15;
    pub const RX_GET_ERROR: u32 = 0x16;
    pub const FREE_RX: u32 = 0x17;

    pub const SETUP_TX_CHANNEL: u32 = 0x20;
    pub const TX_ENQUEUE: u32 = 0x21;
    pub const TX_SINGLE: u32 = 0x22;
    pub const TX_CONTINUOUS: u32 = 0x23;
    pub const TX_STOP: u32 = 0x24;
    pub const TX_GET_NEXT_INDEX: u32 = 0x25;
    pub const TX_GET_ERROR: u32 = 0x26;
    pub const FREE_TX: u32 = 0x27;
    pub const TX_GET_FILL_INDEX: u32 = 0x28;

    pub const GET_PROPERTIES: u32 = 0x30;
    pub const TEST_LOOPBACK: u32 = 0x31;

    /// Completion-signal selector: notify on every transfer.
    pub const SIGNAL_TRANSFER_COMPLETE: u64 = 0;
    /// Completion-signal selector: notify on data-flow events.
    pub const SIGNAL_DATAFLOW: u64 = 1;
}

/// A control command.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Channel(Direction, ChannelOp),
    Device(DeviceOp),
}

/// Operations on one channel.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChannelOp {
    Setup(ChannelParams),
    /// Outbound only.
    Enqueue(usize),
    SetMode { mode: Mode, notify: NotifyOn },
    Stop,
    /// Read and clear the latched error.
    GetError,
    /// Read and advance the read cursor.
    GetNextIndex,
    /// Outbound only. The slot to fill next.
    GetFillIndex,
    Free,
}

/// Device-wide operations.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceOp {
    GetProperties,
    TestLoopback(LoopbackParams),
}

/// The argument accompanying a raw opcode.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RawArg {
    None,
    Value(u64),
    Channel(ChannelParams),
    Loopback(LoopbackParams),
}

/// A successful command's result.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Done,
    Error(ErrorCode),
    Index(usize),
    Properties(Properties),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlError {
    /// The opcode is not recognized.
    UnknownOp(u32),
    /// The operation does not exist for this direction.
    NotApplicable {
        direction: Direction,
        op: &'static str,
    },
    /// The device has no channel in this direction.
    NoChannel(Direction),
    /// The operation was applicable, but failed.
    Failed(Error),
}

// === impl Command ===

impl Command {
    /// Decodes a numeric command.
    pub fn from_raw(op: u32, arg: RawArg) -> Result<Self, ControlError> {
        use self::opcode::*;
        use crate::Direction::*;

        let chan = |direction: Direction, op: ChannelOp| -> Result<Self, ControlError> {
            Ok(Command::Channel(direction, op))
        };
        match op {
            SETUP_RX_CHANNEL => chan(Inbound, ChannelOp::Setup(arg.channel_params()?)),
            RX_SINGLE => chan(Inbound, set_mode(Mode::Single, arg.signal()?)),
            RX_BURST => chan(
                Inbound,
                set_mode(Mode::Burst(arg.count()?), NotifyOn::TransferComplete),
            ),
            RX_CONTINUOUS => chan(Inbound, set_mode(Mode::Continuous, arg.signal()?)),
            RX_STOP => chan(Inbound, ChannelOp::Stop),
            RX_GET_NEXT_INDEX => chan(Inbound, ChannelOp::GetNextIndex),
            RX_GET_ERROR => chan(Inbound, ChannelOp::GetError),
            FREE_RX => chan(Inbound, ChannelOp::Free),

            SETUP_TX_CHANNEL => chan(Outbound, ChannelOp::Setup(arg.channel_params()?)),
            TX_ENQUEUE => chan(Outbound, ChannelOp::Enqueue(arg.count()?)),
            TX_SINGLE => chan(Outbound, set_mode(Mode::Single, NotifyOn::TransferComplete)),
            TX_CONTINUOUS => chan(Outbound, set_mode(Mode::Continuous, arg.signal()?)),
            TX_STOP => chan(Outbound, ChannelOp::Stop),
            TX_GET_NEXT_INDEX => chan(Outbound, ChannelOp::GetNextIndex),
            TX_GET_ERROR => chan(Outbound, ChannelOp::GetError),
            FREE_TX => chan(Outbound, ChannelOp::Free),
            TX_GET_FILL_INDEX => chan(Outbound, ChannelOp::GetFillIndex),

            GET_PROPERTIES => Ok(Command::Device(DeviceOp::GetProperties)),
            TEST_LOOPBACK => match arg {
                RawArg::Loopback(params) => Ok(Command::Device(DeviceOp::TestLoopback(params))),
                _ => Err(invalid("loopback parameters expected")),
            },

            op => Err(ControlError::UnknownOp(op)),
        }
    }
}

fn set_mode(mode: Mode, notify: NotifyOn) -> ChannelOp {
    ChannelOp::SetMode { mode, notify }
}

fn invalid(what: &'static str) -> ControlError {
    ControlError::Failed(Error::InvalidArgument(what))
}

// === impl ChannelOp ===

impl ChannelOp {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ChannelOp::Setup(_) => "setup",
            ChannelOp::Enqueue(_) => "enqueue",
            ChannelOp::SetMode {
                mode: Mode::Single, ..
            } => "single",
            ChannelOp::SetMode {
                mode: Mode::Burst(_),
                ..
            } => "burst",
            ChannelOp::SetMode {
                mode: Mode::Continuous,
                ..
            } => "continuous",
            ChannelOp::Stop => "stop",
            ChannelOp::GetError => "get-error",
            ChannelOp::GetNextIndex => "get-next-index",
            ChannelOp::GetFillIndex => "get-fill-index",
            ChannelOp::Free => "free",
        }
    }

    /// Returns `true` if this operation exists for `direction`.
    #[must_use]
    pub fn applies_to(&self, direction: Direction) -> bool {
        match self {
            ChannelOp::Enqueue(_) | ChannelOp::GetFillIndex => direction.is_outbound(),
            ChannelOp::SetMode {
                mode: Mode::Burst(_),
                ..
            } => direction.is_inbound(),
            _ => true,
        }
    }
}

// === impl RawArg ===

impl RawArg {
    fn channel_params(self) -> Result<ChannelParams, ControlError> {
        match self {
            RawArg::Channel(params) => Ok(params),
            _ => Err(invalid("channel parameters expected")),
        }
    }

    fn count(self) -> Result<usize, ControlError> {
        match self {
            RawArg::Value(n) => usize::try_from(n).map_err(|_| invalid("count out of range")),
            _ => Err(invalid("count expected")),
        }
    }

    fn signal(self) -> Result<NotifyOn, ControlError> {
        match self {
            RawArg::Value(opcode::SIGNAL_TRANSFER_COMPLETE) => Ok(NotifyOn::TransferComplete),
            RawArg::Value(opcode::SIGNAL_DATAFLOW) => Ok(NotifyOn::Dataflow),
            _ => Err(invalid("unknown completion signal")),
        }
    }
}

// === impl Device ===

impl<C, M, R> Device<C, M, R>
where
    C: DeviceChannel,
    M: CoherentMemory,
    R: Registers,
{
    /// Runs a control command.
    pub fn dispatch(&mut self, command: Command) -> Result<Reply, ControlError> {
        tracing::trace!(?command, "dispatch");
        let (direction, op) = match command {
            Command::Device(DeviceOp::GetProperties) => {
                return self
                    .properties()
                    .map(Reply::Properties)
                    .ok_or(ControlError::Failed(ConfigError::NoBuffer.into()));
            }
            Command::Device(DeviceOp::TestLoopback(params)) => {
                self.test_loopback(&params).map_err(ControlError::Failed)?;
                return Ok(Reply::Done);
            }
            Command::Channel(direction, op) => (direction, op),
        };

        if !op.applies_to(direction) {
            return Err(ControlError::NotApplicable {
                direction,
                op: op.name(),
            });
        }
        let chan = self
            .channel(direction)
            .ok_or(ControlError::NoChannel(direction))?;
        let reply = match op {
            ChannelOp::Setup(params) => self.setup_channel(direction, &params).map(|()| Reply::Done),
            ChannelOp::Free => {
                self.free_channel(direction);
                Ok(Reply::Done)
            }
            ChannelOp::Enqueue(count) => chan.enqueue(count).map(|()| Reply::Done),
            ChannelOp::SetMode { mode, notify } => chan.set_mode(mode, notify).map(|()| Reply::Done),
            ChannelOp::Stop => chan.stop().map(|()| Reply::Done),
            ChannelOp::GetError => Ok(Reply::Error(chan.take_error())),
            ChannelOp::GetNextIndex => chan.next_index().map(Reply::Index),
            ChannelOp::GetFillIndex => chan.fill_index().map(Reply::Index),
        };
        reply.map_err(ControlError::Failed)
    }

    /// Decodes and runs a numeric command.
    pub fn dispatch_raw(&mut self, op: u32, arg: RawArg) -> Result<Reply, ControlError> {
        let command = Command::from_raw(op, arg)?;
        self.dispatch(command)
    }
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlError::UnknownOp(op) => write!(f, "unknown operation {op:#x}"),
            ControlError::NotApplicable { direction, op } => {
                write!(f, "{op} is not supported on a {direction} channel")
            }
            ControlError::NoChannel(direction) => write!(f, "no {direction} channel"),
            ControlError::Failed(error) => fmt::Display::fmt(error, f),
        }
    }
}

#[cfg(feature = "use-std")]
impl std::error::Error for ControlError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Watermarks,
        error::QueueFull,
        registry::Registry,
        sim::{SimChannel, SimEngine, SimMemory, SimRegisters},
    };
    use alloc::sync::Arc;

    type SimDevice = Device<SimChannel, SimMemory, SimRegisters>;

    const RX_PARAMS: ChannelParams = ChannelParams {
        total_rings: 4,
        bytes_per_ring: 1024,
        desc_length: 256,
        counter: 1024,
    };

    fn device(engine: &mut SimEngine) -> SimDevice {
        crate::test_util::trace_init();
        let mut dev = Device::probe(
            Arc::new(Registry::new("ringdma")),
            engine,
            SimMemory::new(1 << 16),
            SimRegisters::new(),
            Watermarks::default(),
        )
        .unwrap();
        dev.allocate_buffer(1 << 16).unwrap();
        dev
    }

    #[test]
    fn decodes_raw_commands() {
        use opcode::*;
        assert_eq!(
            Command::from_raw(RX_BURST, RawArg::Value(3)),
            Ok(Command::Channel(
                Direction::Inbound,
                ChannelOp::SetMode {
                    mode: Mode::Burst(3),
                    notify: NotifyOn::TransferComplete
                }
            ))
        );
        assert_eq!(
            Command::from_raw(TX_CONTINUOUS, RawArg::Value(SIGNAL_DATAFLOW)),
            Ok(Command::Channel(
                Direction::Outbound,
                ChannelOp::SetMode {
                    mode: Mode::Continuous,
                    notify: NotifyOn::Dataflow
                }
            ))
        );
        assert_eq!(
            Command::from_raw(TX_ENQUEUE, RawArg::Value(2)),
            Ok(Command::Channel(Direction::Outbound, ChannelOp::Enqueue(2)))
        );
        assert_eq!(
            Command::from_raw(GET_PROPERTIES, RawArg::None),
            Ok(Command::Device(DeviceOp::GetProperties))
        );
    }

    #[test]
    fn unknown_op_is_distinct_from_failure() {
        assert_eq!(
            Command::from_raw(0xFFFF, RawArg::None),
            Err(ControlError::UnknownOp(0xFFFF))
        );
        assert!(matches!(
            Command::from_raw(opcode::RX_SINGLE, RawArg::Value(7)),
            Err(ControlError::Failed(Error::InvalidArgument(_)))
        ));
        assert!(matches!(
            Command::from_raw(opcode::SETUP_TX_CHANNEL, RawArg::Value(7)),
            Err(ControlError::Failed(Error::InvalidArgument(_)))
        ));
    }

    #[test]
    fn not_applicable_by_direction() {
        let mut engine = SimEngine::new();
        let mut dev = device(&mut engine);
        assert_eq!(
            dev.dispatch(Command::Channel(Direction::Inbound, ChannelOp::Enqueue(1))),
            Err(ControlError::NotApplicable {
                direction: Direction::Inbound,
                op: "enqueue"
            })
        );
        assert_eq!(
            dev.dispatch(Command::Channel(
                Direction::Outbound,
                ChannelOp::SetMode {
                    mode: Mode::Burst(1),
                    notify: NotifyOn::TransferComplete
                }
            )),
            Err(ControlError::NotApplicable {
                direction: Direction::Outbound,
                op: "burst"
            })
        );
    }

    #[test]
    fn full_command_sequence() {
        use opcode::*;
        let mut engine = SimEngine::new();
        let mut dev = device(&mut engine);

        let props = match dev.dispatch_raw(GET_PROPERTIES, RawArg::None).unwrap() {
            Reply::Properties(props) => props,
            reply => panic!("unexpected reply {reply:?}"),
        };
        assert_eq!(props.size, 1 << 16);

        dev.dispatch_raw(SETUP_RX_CHANNEL, RawArg::Channel(RX_PARAMS))
            .unwrap();
        dev.dispatch_raw(SETUP_TX_CHANNEL, RawArg::Channel(RX_PARAMS))
            .unwrap();

        // an empty outbound queue can't send a single transfer.
        assert_eq!(
            dev.dispatch_raw(TX_SINGLE, RawArg::None),
            Err(ControlError::Failed(Error::QueueEmpty))
        );
        assert_eq!(
            dev.dispatch_raw(TX_ENQUEUE, RawArg::Value(4)),
            Err(ControlError::Failed(Error::QueueFull(QueueFull {
                queued: 0,
                requested: 4,
                capacity: 4
            })))
        );
        assert_eq!(dev.dispatch_raw(TX_ENQUEUE, RawArg::Value(1)), Ok(Reply::Done));
        assert_eq!(dev.dispatch_raw(TX_GET_FILL_INDEX, RawArg::None), Ok(Reply::Index(0)));
        assert_eq!(dev.dispatch_raw(TX_SINGLE, RawArg::None), Ok(Reply::Done));
        assert_eq!(dev.dispatch_raw(RX_SINGLE, RawArg::Value(SIGNAL_TRANSFER_COMPLETE)), Ok(Reply::Done));
        assert_eq!(engine.run(8), 2);

        assert_eq!(dev.dispatch_raw(RX_GET_NEXT_INDEX, RawArg::None), Ok(Reply::Index(0)));
        assert_eq!(dev.dispatch_raw(RX_GET_NEXT_INDEX, RawArg::None), Ok(Reply::Index(1)));
        assert_eq!(
            dev.dispatch_raw(RX_GET_ERROR, RawArg::None),
            Ok(Reply::Error(ErrorCode::None))
        );
        assert_eq!(dev.dispatch_raw(RX_STOP, RawArg::None), Ok(Reply::Done));
        assert_eq!(dev.dispatch_raw(TX_STOP, RawArg::None), Ok(Reply::Done));

        assert_eq!(dev.dispatch_raw(FREE_RX, RawArg::None), Ok(Reply::Done));
        assert_eq!(
            dev.dispatch_raw(RX_STOP, RawArg::None),
            Err(ControlError::NoChannel(Direction::Inbound))
        );
    }

    #[test]
    fn properties_without_buffer_fail() {
        let mut engine = SimEngine::new();
        let mut dev = device(&mut engine);
        dev.release_buffer().unwrap();
        assert_eq!(
            dev.dispatch(Command::Device(DeviceOp::GetProperties)),
            Err(ControlError::Failed(Error::Config(ConfigError::NoBuffer)))
        );
    }
}
