use std::fmt;

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::types::job::Priority;

/// The 4-byte sentinel opening every binary request frame.
pub const MAGIC_REQ: &[u8; 4] = b"\0REQ";
/// The 4-byte sentinel opening every binary response frame.
pub const MAGIC_RES: &[u8; 4] = b"\0RES";

/// Bytes of a binary frame header: magic, opcode, payload size.
pub const HEADER_SIZE: usize = 12;

/// Separator between arguments within a binary payload.
pub const NULL_BYTE: u8 = 0;

/// The Gearman command catalog.
///
/// Every variant maps to a fixed opcode and an ordered list of named
/// byte-string parameters (see [PacketType::param_names]); only the last
/// parameter of a command may contain NUL bytes. [PacketType::TextCommand]
/// is synthetic: it never appears inside a binary frame and instead carries
/// one line of the textual admin protocol.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum PacketType {
    /// Worker registers an ability.
    ///
    /// On the wire: opcode 1, args `task`.
    CanDo,
    /// Worker withdraws an ability.
    ///
    /// On the wire: opcode 2, args `task`.
    CantDo,
    /// Worker withdraws every registered ability.
    ///
    /// On the wire: opcode 3, no args.
    ResetAbilities,
    /// Worker announces it is about to sleep and wants a NOOP when work
    /// arrives.
    ///
    /// On the wire: opcode 4, no args.
    PreSleep,
    /// Server wakes a sleeping worker.
    ///
    /// On the wire: opcode 6, no args.
    Noop,
    /// Client submits a normal-priority foreground job.
    ///
    /// On the wire: opcode 7, args `task`, `unique`, `data`.
    SubmitJob,
    /// Server acknowledges a submission with the assigned handle.
    ///
    /// On the wire: opcode 8, args `job_handle`.
    JobCreated,
    /// Worker asks for a job.
    ///
    /// On the wire: opcode 9, no args.
    GrabJob,
    /// Server has no job for this worker; go back to sleep.
    ///
    /// On the wire: opcode 10, no args.
    NoJob,
    /// Server hands a job to a worker.
    ///
    /// On the wire: opcode 11, args `job_handle`, `task`, `data`.
    JobAssign,
    /// Worker reports numeric progress; relayed to the client.
    ///
    /// On the wire: opcode 12, args `job_handle`, `numerator`,
    /// `denominator`.
    WorkStatus,
    /// Worker reports successful completion with the result payload.
    ///
    /// On the wire: opcode 13, args `job_handle`, `data`.
    WorkComplete,
    /// Worker reports failure without a payload.
    ///
    /// On the wire: opcode 14, args `job_handle`.
    WorkFail,
    /// Client asks for the status of a background job.
    ///
    /// On the wire: opcode 15, args `job_handle`.
    GetStatus,
    /// Either side requests an echo; used here as the admin ping.
    ///
    /// On the wire: opcode 16, args `data`.
    EchoReq,
    /// Echo reply carrying the request payload unchanged.
    ///
    /// On the wire: opcode 17, args `data`.
    EchoRes,
    /// Client submits a normal-priority background job.
    ///
    /// On the wire: opcode 18, args `task`, `unique`, `data`.
    SubmitJobBg,
    /// Server reports a protocol-level error.
    ///
    /// On the wire: opcode 19, args `error_code`, `error_text`.
    Error,
    /// Server answers a GET_STATUS request.
    ///
    /// On the wire: opcode 20, args `job_handle`, `known`, `running`,
    /// `numerator`, `denominator`.
    StatusRes,
    /// Client submits a high-priority foreground job.
    ///
    /// On the wire: opcode 21, args `task`, `unique`, `data`.
    SubmitJobHigh,
    /// Worker advertises an identity visible in the admin `workers` list.
    ///
    /// On the wire: opcode 22, args `client_id`.
    SetClientId,
    /// Worker registers an ability with an execution timeout.
    ///
    /// On the wire: opcode 23, args `task`, `timeout`.
    CanDoTimeout,
    /// Worker offers to become exclusive to this server.
    ///
    /// On the wire: opcode 24, no args.
    AllYours,
    /// Worker forwards an exception payload before failing the job.
    ///
    /// On the wire: opcode 25, args `job_handle`, `data`.
    WorkException,
    /// Either side requests a connection option.
    ///
    /// On the wire: opcode 26, args `option_name`.
    OptionReq,
    /// Acknowledges an option request.
    ///
    /// On the wire: opcode 27, args `option_name`.
    OptionRes,
    /// Worker streams an intermediate chunk of result data.
    ///
    /// On the wire: opcode 28, args `job_handle`, `data`.
    WorkData,
    /// Worker streams a warning chunk.
    ///
    /// On the wire: opcode 29, args `job_handle`, `data`.
    WorkWarning,
    /// Worker asks for a job, including its uniqueness key.
    ///
    /// On the wire: opcode 30, no args.
    GrabJobUniq,
    /// Server hands a job plus its uniqueness key to a worker.
    ///
    /// On the wire: opcode 31, args `job_handle`, `task`, `unique`,
    /// `data`.
    JobAssignUniq,
    /// Client submits a high-priority background job.
    ///
    /// On the wire: opcode 32, args `task`, `unique`, `data`.
    SubmitJobHighBg,
    /// Client submits a low-priority foreground job.
    ///
    /// On the wire: opcode 33, args `task`, `unique`, `data`.
    SubmitJobLow,
    /// Client submits a low-priority background job.
    ///
    /// On the wire: opcode 34, args `task`, `unique`, `data`.
    SubmitJobLowBg,
    /// Client submits a job to run at a cron-style schedule.
    ///
    /// On the wire: opcode 35, args `task`, `unique`, `minute`, `hour`,
    /// `day_of_month`, `month`, `day_of_week`, `data`.
    SubmitJobSched,
    /// Client submits a job to run at a UNIX timestamp.
    ///
    /// On the wire: opcode 36, args `task`, `unique`, `epoch_time`,
    /// `data`.
    SubmitJobEpoch,
    /// Synthetic carrier for one line of the textual admin protocol. Never
    /// valid inside a binary frame.
    ///
    /// Args: `raw_text`.
    TextCommand,
}

impl PacketType {
    /// The wire opcode for this command.
    pub fn opcode(self) -> u32 {
        use PacketType::*;

        match self {
            CanDo => 1,
            CantDo => 2,
            ResetAbilities => 3,
            PreSleep => 4,
            Noop => 6,
            SubmitJob => 7,
            JobCreated => 8,
            GrabJob => 9,
            NoJob => 10,
            JobAssign => 11,
            WorkStatus => 12,
            WorkComplete => 13,
            WorkFail => 14,
            GetStatus => 15,
            EchoReq => 16,
            EchoRes => 17,
            SubmitJobBg => 18,
            Error => 19,
            StatusRes => 20,
            SubmitJobHigh => 21,
            SetClientId => 22,
            CanDoTimeout => 23,
            AllYours => 24,
            WorkException => 25,
            OptionReq => 26,
            OptionRes => 27,
            WorkData => 28,
            WorkWarning => 29,
            GrabJobUniq => 30,
            JobAssignUniq => 31,
            SubmitJobHighBg => 32,
            SubmitJobLow => 33,
            SubmitJobLowBg => 34,
            SubmitJobSched => 35,
            SubmitJobEpoch => 36,
            // Deliberately outside the server's opcode space: text lines
            // have no binary encoding.
            TextCommand => 10293,
        }
    }

    /// Looks an opcode up in the catalog.
    pub fn from_opcode(opcode: u32) -> Option<Self> {
        use PacketType::*;

        Some(match opcode {
            1 => CanDo,
            2 => CantDo,
            3 => ResetAbilities,
            4 => PreSleep,
            6 => Noop,
            7 => SubmitJob,
            8 => JobCreated,
            9 => GrabJob,
            10 => NoJob,
            11 => JobAssign,
            12 => WorkStatus,
            13 => WorkComplete,
            14 => WorkFail,
            15 => GetStatus,
            16 => EchoReq,
            17 => EchoRes,
            18 => SubmitJobBg,
            19 => Error,
            20 => StatusRes,
            21 => SubmitJobHigh,
            22 => SetClientId,
            23 => CanDoTimeout,
            24 => AllYours,
            25 => WorkException,
            26 => OptionReq,
            27 => OptionRes,
            28 => WorkData,
            29 => WorkWarning,
            30 => GrabJobUniq,
            31 => JobAssignUniq,
            32 => SubmitJobHighBg,
            33 => SubmitJobLow,
            34 => SubmitJobLowBg,
            35 => SubmitJobSched,
            36 => SubmitJobEpoch,
            10293 => TextCommand,
            _ => return None,
        })
    }

    /// The ordered parameter names for this command. Only the last listed
    /// parameter may contain NUL bytes on the wire.
    pub fn param_names(self) -> &'static [&'static str] {
        use PacketType::*;

        match self {
            ResetAbilities | PreSleep | Noop | GrabJob | NoJob | AllYours
            | GrabJobUniq => &[],
            CanDo | CantDo => &["task"],
            SubmitJob | SubmitJobBg | SubmitJobHigh | SubmitJobHighBg
            | SubmitJobLow | SubmitJobLowBg => &["task", "unique", "data"],
            JobCreated | WorkFail | GetStatus => &["job_handle"],
            JobAssign => &["job_handle", "task", "data"],
            WorkStatus => &["job_handle", "numerator", "denominator"],
            WorkComplete | WorkException | WorkData | WorkWarning => {
                &["job_handle", "data"]
            },
            EchoReq | EchoRes => &["data"],
            Error => &["error_code", "error_text"],
            StatusRes => {
                &["job_handle", "known", "running", "numerator", "denominator"]
            },
            SetClientId => &["client_id"],
            CanDoTimeout => &["task", "timeout"],
            OptionReq | OptionRes => &["option_name"],
            JobAssignUniq => &["job_handle", "task", "unique", "data"],
            SubmitJobSched => &[
                "task",
                "unique",
                "minute",
                "hour",
                "day_of_month",
                "month",
                "day_of_week",
                "data",
            ],
            SubmitJobEpoch => &["task", "unique", "epoch_time", "data"],
            TextCommand => &["raw_text"],
        }
    }

    /// Selects the SUBMIT_JOB variant for a (background, priority) pair.
    pub fn submit_variant(background: bool, priority: Priority) -> Self {
        use PacketType::*;

        match (background, priority) {
            (false, Priority::None) => SubmitJob,
            (false, Priority::Low) => SubmitJobLow,
            (false, Priority::High) => SubmitJobHigh,
            (true, Priority::None) => SubmitJobBg,
            (true, Priority::Low) => SubmitJobLowBg,
            (true, Priority::High) => SubmitJobHighBg,
        }
    }
}

// The canonical GEARMAN_COMMAND_* spelling, for diagnostics.
impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use PacketType::*;

        f.write_str(match self {
            CanDo => "CAN_DO",
            CantDo => "CANT_DO",
            ResetAbilities => "RESET_ABILITIES",
            PreSleep => "PRE_SLEEP",
            Noop => "NOOP",
            SubmitJob => "SUBMIT_JOB",
            JobCreated => "JOB_CREATED",
            GrabJob => "GRAB_JOB",
            NoJob => "NO_JOB",
            JobAssign => "JOB_ASSIGN",
            WorkStatus => "WORK_STATUS",
            WorkComplete => "WORK_COMPLETE",
            WorkFail => "WORK_FAIL",
            GetStatus => "GET_STATUS",
            EchoReq => "ECHO_REQ",
            EchoRes => "ECHO_RES",
            SubmitJobBg => "SUBMIT_JOB_BG",
            Error => "ERROR",
            StatusRes => "STATUS_RES",
            SubmitJobHigh => "SUBMIT_JOB_HIGH",
            SetClientId => "SET_CLIENT_ID",
            CanDoTimeout => "CAN_DO_TIMEOUT",
            AllYours => "ALL_YOURS",
            WorkException => "WORK_EXCEPTION",
            OptionReq => "OPTION_REQ",
            OptionRes => "OPTION_RES",
            WorkData => "WORK_DATA",
            WorkWarning => "WORK_WARNING",
            GrabJobUniq => "GRAB_JOB_UNIQ",
            JobAssignUniq => "JOB_ASSIGN_UNIQ",
            SubmitJobHighBg => "SUBMIT_JOB_HIGH_BG",
            SubmitJobLow => "SUBMIT_JOB_LOW",
            SubmitJobLowBg => "SUBMIT_JOB_LOW_BG",
            SubmitJobSched => "SUBMIT_JOB_SCHED",
            SubmitJobEpoch => "SUBMIT_JOB_EPOCH",
            TextCommand => "TEXT_COMMAND",
        })
    }
}

/// One parsed or to-be-packed frame: a command plus its arguments in
/// catalog order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Packet {
    pub kind: PacketType,
    pub args: Vec<Bytes>,
}

impl Packet {
    pub fn new(kind: PacketType, args: Vec<Bytes>) -> Self {
        Self { kind, args }
    }

    /// A frame with no arguments.
    pub fn empty(kind: PacketType) -> Self {
        Self { kind, args: Vec::new() }
    }

    /// A TEXT_COMMAND frame carrying one raw line (terminator included by
    /// the caller).
    pub fn text(raw_text: impl Into<Bytes>) -> Self {
        Self {
            kind: PacketType::TextCommand,
            args: vec![raw_text.into()],
        }
    }

    /// Borrows the arguments as a fixed-arity array, failing with a
    /// ProtocolError when the frame does not match.
    pub fn expect_args<const N: usize>(
        &self,
    ) -> Result<&[Bytes; N], ProtocolError> {
        self.args.as_slice().try_into().map_err(|_| {
            ProtocolError::WrongArgCount {
                kind: self.kind,
                received: self.args.len(),
                expected: N,
            }
        })
    }
}
