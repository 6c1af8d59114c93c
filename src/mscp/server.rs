// The MSCP/TMSCP server core.
//
// All commands are executed sequentially, exactly as they appear in the
// command ring -- including anything in the "Immediate" category. A real
// controller (the original UDA50, say) would resequence commands for
// throughput across units; the emulated storage underneath is so much
// faster than the bus that a braindead in-order implementation still
// saturates it.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use log::{debug, error, info};

use crate::mscp::{opcode, status, subcode, pack_status, status_word, flags_byte,
                  Message, HEADER_SIZE, HEADER_OFFSET, WORD3_OFFSET,
                  INIT_CREDITS, MAX_CREDITS, MESSAGE_TYPE_SEQUENTIAL};
use crate::mscp::port::Port;

/// Disk servers answer REPLACE; tape servers answer the tape positioning
/// commands. Everything else is shared.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerKind {
    Disk,
    Tape,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PollState {
    /// Thread parked on the condvar.
    Wait,
    /// Doorbell rung; thread will move to Run when it wakes.
    InitRun,
    /// Draining and executing the ring.
    Run,
    /// Reset pending: abandon queued work, park, signal the resetter.
    InitRestart,
}

struct Control {
    state: PollState,
    abort_polling: bool,
    credits: u8,
    host_timeout: u16,
    controller_flags: u16,
}

struct Shared<P: Port> {
    kind: ServerKind,
    control: Mutex<Control>,
    cond: Condvar,
    port: Mutex<P>,
}

/// Owns the polling thread. Other threads interact with the server only
/// through `init_polling` (the doorbell), `reset`, and drop.
pub struct Server<P: Port + 'static> {
    shared: Arc<Shared<P>>,
    thread: Option<JoinHandle<()>>,
}

impl<P: Port + 'static> Server<P> {
    pub fn new(kind: ServerKind, port: P) -> Server<P> {
        let shared = Arc::new(Shared {
            kind,
            control: Mutex::new(Control {
                state: PollState::Wait,
                abort_polling: false,
                credits: INIT_CREDITS,
                host_timeout: 0,
                controller_flags: 0,
            }),
            cond: Condvar::new(),
            port: Mutex::new(port),
        });
        let thread = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("mscp-poll".to_string())
                .spawn(move || poll(&shared))
                .expect("Failed to start mscp server thread")
        };
        Server { shared, thread: Some(thread) }
    }

    /// The doorbell: the host rang the initiate-polling register.
    pub fn init_polling(&self) {
        let mut control = self.shared.control.lock().unwrap();
        debug!("waking polling thread");
        control.state = PollState::InitRun;
        self.shared.cond.notify_all();
    }

    /// Reset the server. Blocks until the polling thread has abandoned any
    /// queued work and parked, then restores the credit bank and forces
    /// every drive offline. The command actively executing when the reset
    /// lands completes normally first.
    pub fn reset(&self) {
        debug!("aborting polling due to reset");
        let mut control = self.shared.control.lock().unwrap();
        if control.state != PollState::Wait {
            control.state = PollState::InitRestart;
            self.shared.cond.notify_all();
            while control.state != PollState::Wait {
                control = self.shared.cond.wait(control).unwrap();
            }
        }
        control.credits = INIT_CREDITS;
        drop(control);

        let mut port = self.shared.port.lock().unwrap();
        for unit in 0..port.drive_count() as u16 {
            if let Some(drive) = port.drive_mut(unit) {
                drive.set_offline();
            }
        }
    }

    /// Block until the polling thread is parked. The register glue uses
    /// this to sequence its own handshake with the host.
    pub fn wait_idle(&self) {
        let mut control = self.shared.control.lock().unwrap();
        while control.state != PollState::Wait {
            control = self.shared.cond.wait(control).unwrap();
        }
    }

    pub fn credits(&self) -> u8 {
        self.shared.control.lock().unwrap().credits
    }

    pub fn host_timeout(&self) -> u16 {
        self.shared.control.lock().unwrap().host_timeout
    }

    pub fn controller_flags(&self) -> u16 {
        self.shared.control.lock().unwrap().controller_flags
    }

    /// Access the port (and through it the drives) from outside the server,
    /// e.g. to attach images. Serialised against the polling thread.
    pub fn with_port<R>(&self, f: impl FnOnce(&mut P) -> R) -> R {
        f(&mut self.shared.port.lock().unwrap())
    }
}

impl<P: Port + 'static> Drop for Server<P> {
    fn drop(&mut self) {
        {
            let mut control = self.shared.control.lock().unwrap();
            control.abort_polling = true;
            self.shared.cond.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("mscp polling thread panicked");
            }
        }
        debug!("polling thread stopped");
    }
}

/// The polling thread. Waits to be awoken, then pulls messages from the
/// command ring and executes them. When no work is left it goes back to
/// sleep.
fn poll<P: Port>(shared: &Shared<P>) {
    loop {
        {
            let mut control = shared.control.lock().unwrap();
            while control.state == PollState::Wait && !control.abort_polling {
                control = shared.cond.wait(control).unwrap();
            }
            if control.abort_polling {
                return;
            }
            if control.state == PollState::InitRun {
                control.state = PollState::Run;
            }
        }

        // Read all commands from the ring into a queue, then execute them.
        let mut queue: VecDeque<Message> = VecDeque::new();
        {
            let mut port = shared.port.lock().unwrap();
            loop {
                {
                    let control = shared.control.lock().unwrap();
                    if control.abort_polling || control.state == PollState::InitRestart {
                        break;
                    }
                }
                match port.next_command() {
                    Err(e) => {
                        debug!("{} while reading messages, returning to idle state", e);
                        queue.clear();
                        break;
                    }
                    Ok(None) => {
                        debug!("end of command ring; {} messages to be executed", queue.len());
                        break;
                    }
                    Ok(Some(message)) => queue.push_back(message),
                }
            }
        }

        while let Some(mut message) = queue.pop_front() {
            {
                let control = shared.control.lock().unwrap();
                if control.abort_polling || control.state == PollState::InitRestart {
                    break;
                }
            }

            debug!("message len {:#x} opcode {:#x} mod {:#x} unit {} ref {:#x}",
                   message.message_length(), message.opcode(), message.modifiers(),
                   message.unit_number(), message.reference_number());

            let opcode_in = message.opcode();
            let mut port = shared.port.lock().unwrap();
            let (mut cmd_status, protocol_error) = dispatch_command(shared, &mut port, &mut message);

            if protocol_error {
                let sub_code = WORD3_OFFSET as u16 + HEADER_OFFSET;
                cmd_status = pack_status(status::INVALID_COMMAND, sub_code, 0);
            }

            debug!("cmd {:#x} st {:#x} fl {:#x}", cmd_status, status_word(cmd_status), flags_byte(cmd_status));

            // For a protocol error the endcode is just END; for everything
            // else it's END or'd with the original opcode.
            if protocol_error {
                message.set_end(opcode::END, flags_byte(cmd_status), status_word(cmd_status));
            } else {
                message.set_end(opcode_in, flags_byte(cmd_status), status_word(cmd_status));
                message.or_endcode(opcode::END);
            }

            if message.message_type == MESSAGE_TYPE_SEQUENTIAL && message.endcode() & opcode::END != 0 {
                // The credits hack simh uses: hand the host the whole bank,
                // then one credit per response packet sent.
                let mut control = shared.control.lock().unwrap();
                let granted = control.credits.min(MAX_CREDITS);
                control.credits -= granted;
                message.credits = granted + 1;
                debug!("granted credits {}", granted + 1);
            } else {
                message.credits = 0;
            }

            if !port.post_response(message) {
                panic!("Unexpected: no room in response ring.");
            }
        }

        // Going back to sleep. If a reset is pending, signal the Reset()
        // caller that the poll is done and the thread is parked.
        let mut control = shared.control.lock().unwrap();
        match control.state {
            PollState::InitRestart => {
                debug!("polling thread reset");
                control.state = PollState::Wait;
                shared.cond.notify_all();
            }
            PollState::InitRun => control.state = PollState::Run,
            _ => control.state = PollState::Wait,
        }
    }
}

// Byte offsets inside the transfer command parameter area
// (READ/WRITE/ERASE/ACCESS/COMPARE HOST DATA).
const P_BYTE_COUNT: usize = 0;
const P_BUFFER_PA:  usize = 4;
const P_LBN:        usize = 16;
const RWE_SIZE:     usize = 20;

fn dispatch_command<P: Port>(shared: &Shared<P>, port: &mut P, message: &mut Message) -> (u32, bool) {
    let unit = message.unit_number();
    let modifiers = message.modifiers();
    let st = match message.opcode() {
        opcode::ABORT                          => abort(),
        opcode::ACCESS                         => do_disk_transfer(opcode::ACCESS, port, message, unit),
        opcode::AVAILABLE                      => available(port, unit, modifiers),
        opcode::COMPARE_HOST_DATA              => do_disk_transfer(opcode::COMPARE_HOST_DATA, port, message, unit),
        opcode::DETERMINE_ACCESS_PATHS         => determine_access_paths(port, unit),
        opcode::ERASE                          => do_disk_transfer(opcode::ERASE, port, message, unit),
        opcode::GET_COMMAND_STATUS             => get_command_status(message),
        opcode::GET_UNIT_STATUS                => get_unit_status(port, message, unit, modifiers),
        opcode::ONLINE                         => set_unit_characteristics_internal(port, message, unit, true),
        opcode::READ                           => do_disk_transfer(opcode::READ, port, message, unit),
        opcode::SET_CONTROLLER_CHARACTERISTICS => set_controller_characteristics(shared, port, message),
        opcode::SET_UNIT_CHARACTERISTICS       => set_unit_characteristics_internal(port, message, unit, false),
        opcode::WRITE                          => do_disk_transfer(opcode::WRITE, port, message, unit),
        op => return dispatch_variant(shared.kind, port, message, op, unit),
    };
    (st, false)
}

/// Secondary dispatch for the opcodes that differ between the disk and tape
/// variants. Unknown opcodes are protocol errors.
fn dispatch_variant<P: Port>(kind: ServerKind, port: &mut P, message: &mut Message, op: u8, unit: u16) -> (u32, bool) {
    match (kind, op) {
        (ServerKind::Disk, opcode::REPLACE) => (replace(port, message, unit), false),
        (ServerKind::Tape, opcode::ERASE_GAP) |
        (ServerKind::Tape, opcode::WRITE_TAPE_MARK) |
        (ServerKind::Tape, opcode::REPOSITION) => (tape_placeholder(port, op, unit), false),
        _ => {
            debug!("unimplemented (T)MSCP command {:#x}", op);
            (0, true)
        }
    }
}

fn abort() -> u32 {
    info!("MSCP ABORT");
    // Commands are picked up and executed one at a time, sequentially as
    // they appear in the ring, so by the time an ABORT arrives the command
    // it refers to is long gone. Ignoring it is semi-legal.
    pack_status(status::SUCCESS, 0, 0)
}

fn available<P: Port>(port: &mut P, unit: u16, _modifiers: u16) -> u32 {
    // No message-specific data; just release the drive. The spin-down
    // modifier is ignored.
    debug!("MSCP AVAILABLE unit {}", unit);
    match port.drive_mut(unit) {
        Some(drive) if drive.is_available() => {
            drive.set_offline();
            pack_status(status::SUCCESS, subcode::STILL_CONNECTED, 0)
        }
        _ => pack_status(status::UNIT_OFFLINE, subcode::UNIT_UNKNOWN, 0),
    }
}

fn determine_access_paths<P: Port>(port: &mut P, unit: u16) -> u32 {
    debug!("MSCP DETERMINE ACCESS PATHS unit {}", unit);
    // "This command must be treated as a no-op that always succeeds if the
    // unit is incapable of being connected to more than one controller."
    // That's us.
    match port.drive(unit) {
        Some(drive) if drive.is_available() => pack_status(status::SUCCESS, 0, 0),
        _ => pack_status(status::UNIT_OFFLINE, subcode::UNIT_UNKNOWN, 0),
    }
}

fn get_command_status(message: &mut Message) -> u32 {
    debug!("MSCP GET COMMAND STATUS");
    // As with ABORT, the referenced command has already been executed.
    message.set_length(HEADER_SIZE + 8);
    message.put_param_u32(0, 0); // outstanding reference number
    message.put_param_u32(4, 0); // command status
    pack_status(status::SUCCESS, 0, 0)
}

fn get_unit_status<P: Port>(port: &mut P, message: &mut Message, mut unit: u16, modifiers: u16) -> u32 {
    debug!("MSCP GET UNIT STATUS unit {}", unit);

    message.set_length(HEADER_SIZE + 36);

    if modifiers & 0x1 != 0 {
        // Next Unit modifier: return the next known unit >= unit. Unless
        // the unit is out of range entirely we just return the unit asked
        // about; out of range acts as if drive 0 was queried.
        if unit as usize >= port.drive_count() {
            unit = 0;
            message.set_unit_number(0);
        }
    }

    let Some(drive) = port.drive(unit) else {
        return pack_status(status::UNIT_OFFLINE, subcode::UNIT_UNKNOWN, 0);
    };
    if !drive.is_available() {
        // No such drive or no image loaded: identity fields read zero.
        return pack_status(status::UNIT_OFFLINE, subcode::UNIT_UNKNOWN, 0);
    }

    let online = drive.is_online();
    let (device_number, class_model, media_id) = (drive.device_number(), drive.class_model(), drive.media_id());
    let (track, group, cylinder) = (drive.sects_per_track(), drive.tracks_per_group(), drive.groups_per_cylinder());
    let (rct_size, rbns, copies) = (drive.rct_size(), drive.rbns(), drive.rct_copies());

    message.put_param_u16(0, 0);                 // multi-unit code: no multi-unit drives
    message.put_param_u16(2, 0);                 // unit flags
    message.put_param_u32(4, 0);
    message.put_param_u32(8, device_number);
    message.put_param_u16(12, 0);
    message.put_param_u16(14, class_model);
    message.put_param_u32(16, media_id);
    message.put_param_u16(20, unit);             // shadow unit: always the unit number
    message.put_param_u16(22, 0);
    message.put_param_u16(24, track);
    message.put_param_u16(26, group);
    message.put_param_u16(28, cylinder);
    message.put_param_u16(30, 0);
    message.put_param_u16(32, rct_size);
    message.put_param_u8(34, rbns);
    message.put_param_u8(35, copies);

    if online {
        pack_status(status::SUCCESS, 0, 0)
    } else {
        pack_status(status::UNIT_AVAILABLE, 0, 0)
    }
}

fn replace<P: Port>(port: &mut P, message: &mut Message, unit: u16) -> u32 {
    info!("MSCP REPLACE unit {}", unit);
    // No block replacement happens at all, so this is a success for any
    // valid unit. Best just to smile and nod.
    message.set_length(HEADER_SIZE);
    match port.drive(unit) {
        Some(drive) if drive.is_available() => pack_status(status::SUCCESS, 0, 0),
        _ => pack_status(status::UNIT_OFFLINE, subcode::UNIT_UNKNOWN, 0),
    }
}

/// ERASE GAP, WRITE TAPE MARK and REPOSITION stubs, pending SIMH-TAP
/// container support in the tape drive. They share the unit gates of the
/// real commands and then claim success.
fn tape_placeholder<P: Port>(port: &mut P, op: u8, unit: u16) -> u32 {
    info!("TMSCP command {:#x} unit {}", op, unit);
    match port.drive(unit) {
        Some(drive) if drive.is_available() => {
            if drive.is_online() {
                pack_status(status::SUCCESS, 0, 0)
            } else {
                pack_status(status::UNIT_AVAILABLE, 0, 0)
            }
        }
        _ => pack_status(status::UNIT_OFFLINE, subcode::UNIT_UNKNOWN, 0),
    }
}

fn set_controller_characteristics<P: Port>(shared: &Shared<P>, port: &mut P, message: &mut Message) -> u32 {
    debug!("MSCP SET CONTROLLER CHARACTERISTICS");

    message.set_length(HEADER_SIZE + 16);

    // A non-zero MSCP version must get an Invalid Command end message.
    if message.param_u16(0) != 0 {
        return pack_status(status::INVALID_COMMAND, 0, 0);
    }

    let controller_flags = message.param_u16(2);
    {
        let mut control = shared.control.lock().unwrap();
        control.host_timeout = message.param_u16(4);
        control.controller_flags = controller_flags;
    }
    // Time and date in the trailing quadword is ignored entirely.

    message.put_param_u16(2, controller_flags & 0xfe); // mask off the 576 byte sector bit:
                                                       // it's read-only and we're a 512 byte
                                                       // sector shop here
    message.put_param_u16(4, 0xff);                    // controller timeout: the max value
    message.put_param_u16(6, 0);
    message.put_param_u32(8, port.controller_identifier());
    message.put_param_u16(12, 0);
    message.put_param_u16(14, port.controller_class_model());

    pack_status(status::SUCCESS, 0, 0)
}

/// Logic common to ONLINE and SET UNIT CHARACTERISTICS. "The ONLINE command
/// performs a SET UNIT CHARACTERISTICS operation after bringing a unit
/// 'Unit-Online'".
fn set_unit_characteristics_internal<P: Port>(port: &mut P, message: &mut Message, unit: u16, bring_online: bool) -> u32 {
    debug!("MSCP {} unit {}", if bring_online { "ONLINE" } else { "SET UNIT CHARACTERISTICS" }, unit);

    message.set_length(HEADER_SIZE + 32);

    let Some(drive) = port.drive_mut(unit) else {
        return pack_status(status::UNIT_OFFLINE, subcode::UNIT_UNKNOWN, 0);
    };
    if !drive.is_available() {
        return pack_status(status::UNIT_OFFLINE, subcode::UNIT_UNKNOWN, 0);
    }

    let (device_number, class_model, media_id) = (drive.device_number(), drive.class_model(), drive.media_id());
    let unit_size = drive.block_count();
    let already_online = drive.is_online();
    if bring_online {
        drive.set_online();
    }

    message.put_param_u16(0, 0);             // unit flags
    message.put_param_u16(2, 0);             // multi-unit code
    message.put_param_u32(4, 0);
    message.put_param_u32(8, device_number);
    message.put_param_u16(12, 0);
    message.put_param_u16(14, class_model);
    message.put_param_u32(16, media_id);
    message.put_param_u32(20, 0);
    message.put_param_u32(24, unit_size);
    message.put_param_u32(28, 0);            // volume serial number

    if bring_online {
        pack_status(status::SUCCESS, if already_online { subcode::ALREADY_ONLINE } else { subcode::NORMAL }, 0)
    } else {
        pack_status(status::SUCCESS, 0, 0)
    }
}

/// Common transfer logic for READ, WRITE, ERASE, COMPARE HOST DATA and
/// ACCESS.
fn do_disk_transfer<P: Port>(operation: u8, port: &mut P, message: &mut Message, unit: u16) -> u32 {
    message.set_length(HEADER_SIZE + RWE_SIZE);

    let byte_count = message.param_u32(P_BYTE_COUNT);
    // The upper 8 bits of the buffer address are a channel address on VAXen.
    let address = message.param_u32(P_BUFFER_PA) & 0x00ff_ffff;
    let lbn = message.param_u32(P_LBN);

    debug!("MSCP RWE {:#x} unit {} pa {:#o} count {} lbn {}", operation, unit, address, byte_count, lbn);

    let (block_count, rct_block_count, block_size) = {
        let Some(drive) = port.drive(unit) else {
            return pack_status(status::UNIT_OFFLINE, subcode::UNIT_UNKNOWN, 0);
        };
        if !drive.is_available() {
            return pack_status(status::UNIT_OFFLINE, subcode::UNIT_UNKNOWN, 0);
        }
        if !drive.is_online() {
            return pack_status(status::UNIT_AVAILABLE, 0, 0);
        }
        (drive.block_count(), drive.rct_block_count(), drive.block_size())
    };

    // Are we accessing the RCT area?
    let rct_access = lbn >= block_count;
    let rct_block_number = lbn.wrapping_sub(block_count);

    if lbn >= block_count + rct_block_count {
        return pack_status(status::INVALID_COMMAND, P_LBN as u16 + HEADER_OFFSET, 0);
    }
    if byte_count as u64 > (block_count + rct_block_count - lbn) as u64 * block_size as u64 {
        return pack_status(status::INVALID_COMMAND, P_BYTE_COUNT as u16 + HEADER_OFFSET, 0);
    }
    // An RCT access must be exactly one block.
    if rct_access && byte_count != block_size {
        return pack_status(status::INVALID_COMMAND, P_BYTE_COUNT as u16 + HEADER_OFFSET, 0);
    }

    match operation {
        opcode::ACCESS => {
            // No transfer: ACCESS merely checks that the data can be read,
            // and the LBN checks above are the only way that can fail here.
        }

        opcode::COMPARE_HOST_DATA => {
            let disk = match read_drive(port, unit, rct_access, rct_block_number, lbn, byte_count) {
                Ok(data) => data,
                Err(st) => return st,
            };
            let Some(memory) = port.dma_read(address, byte_count as usize) else {
                return pack_status(status::HOST_BUFFER_ACCESS_ERROR, subcode::NXM, 0);
            };
            if disk != memory {
                return pack_status(status::COMPARE_ERROR, 0, 0);
            }
        }

        opcode::ERASE => {
            let zeros = vec![0u8; byte_count as usize];
            if let Err(st) = write_drive(port, unit, rct_access, rct_block_number, lbn, &zeros) {
                return st;
            }
        }

        opcode::READ => {
            let disk = match read_drive(port, unit, rct_access, rct_block_number, lbn, byte_count) {
                Ok(data) => data,
                Err(st) => return st,
            };
            if !port.dma_write(address, &disk) {
                return pack_status(status::HOST_BUFFER_ACCESS_ERROR, subcode::NXM, 0);
            }
        }

        opcode::WRITE => {
            let Some(memory) = port.dma_read(address, byte_count as usize) else {
                return pack_status(status::HOST_BUFFER_ACCESS_ERROR, subcode::NXM, 0);
            };
            if let Err(st) = write_drive(port, unit, rct_access, rct_block_number, lbn, &memory) {
                return st;
            }
        }

        op => unreachable!("transfer dispatch for {:#x}", op),
    }

    // First Bad Block in the response reads zero; no bad block is ever
    // reported.
    message.put_param_u32(P_LBN, 0);

    pack_status(status::SUCCESS, 0, 0)
}

fn read_drive<P: Port>(port: &mut P, unit: u16, rct: bool, rct_block: u32, lbn: u32, byte_count: u32) -> Result<Vec<u8>, u32> {
    let drive = port.drive(unit).expect("unit validated");
    if rct {
        Ok(drive.read_rct_block(rct_block))
    } else {
        drive.read(lbn, byte_count as usize).map_err(|e| {
            error!("drive read failed: {:#}", e);
            pack_status(status::DRIVE_ERROR, 0, 0)
        })
    }
}

fn write_drive<P: Port>(port: &mut P, unit: u16, rct: bool, rct_block: u32, lbn: u32, data: &[u8]) -> Result<(), u32> {
    let drive = port.drive_mut(unit).expect("unit validated");
    if rct {
        drive.write_rct_block(rct_block, data);
        Ok(())
    } else {
        drive.write(lbn, data).map_err(|e| {
            error!("drive write failed: {:#}", e);
            pack_status(status::DRIVE_ERROR, 0, 0)
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    use crate::block::FlatImage;
    use crate::mscp::drive::{Drive, DriveType, DriveClass};
    use crate::mscp::port::RingError;

    struct TestPort {
        commands: Arc<Mutex<VecDeque<Message>>>,
        responses: Arc<Mutex<Vec<Message>>>,
        memory: Arc<Mutex<Vec<u8>>>,
        drives: Vec<Drive>,
        ring_error: bool,
        fail_dma: bool,
        dma_entered: Option<mpsc::Sender<()>>,
        dma_gate: Option<mpsc::Receiver<()>>,
    }

    impl TestPort {
        fn new(drives: Vec<Drive>) -> TestPort {
            TestPort {
                commands: Arc::new(Mutex::new(VecDeque::new())),
                responses: Arc::new(Mutex::new(Vec::new())),
                memory: Arc::new(Mutex::new(vec![0; 0x10000])),
                drives,
                ring_error: false,
                fail_dma: false,
                dma_entered: None,
                dma_gate: None,
            }
        }
    }

    impl Port for TestPort {
        fn next_command(&mut self) -> Result<Option<Message>, RingError> {
            if self.ring_error { return Err(RingError) }
            Ok(self.commands.lock().unwrap().pop_front())
        }
        fn post_response(&mut self, message: Message) -> bool {
            self.responses.lock().unwrap().push(message);
            true
        }
        fn dma_read(&mut self, address: u32, count: usize) -> Option<Vec<u8>> {
            if self.fail_dma { return None }
            Some(self.memory.lock().unwrap()[address as usize..address as usize + count].to_vec())
        }
        fn dma_write(&mut self, address: u32, data: &[u8]) -> bool {
            if let Some(entered) = &self.dma_entered {
                entered.send(()).unwrap();
            }
            if let Some(gate) = &self.dma_gate {
                gate.recv().unwrap();
            }
            if self.fail_dma { return false }
            self.memory.lock().unwrap()[address as usize..address as usize + data.len()].copy_from_slice(data);
            true
        }
        fn controller_identifier(&self) -> u32 { 0x00000642 }
        fn controller_class_model(&self) -> u16 { 0x0102 }
        fn drive_count(&self) -> usize { self.drives.len() }
        fn drive(&self, unit: u16) -> Option<&Drive> { self.drives.get(unit as usize) }
        fn drive_mut(&mut self, unit: u16) -> Option<&mut Drive> { self.drives.get_mut(unit as usize) }
    }

    fn test_drive_type() -> DriveType {
        DriveType { name: "TEST", class: DriveClass::Disk, block_count: 100, block_size: 512,
                    sects_per_track: 10, tracks_per_group: 2, groups_per_cylinder: 1,
                    media_id: 0x25644099, class_model: 0x0205, rct_size: 4, rbns: 1, rct_copies: 1, dir_seg_count: 4 }
    }

    fn attached_drive() -> Drive {
        let mut d = Drive::new(test_drive_type(), 1);
        d.attach_image(Box::new(FlatImage::new(100))).unwrap();
        d
    }

    fn rwe_params(byte_count: u32, address: u32, lbn: u32) -> [u8; 20] {
        let mut p = [0u8; 20];
        p[0..4].copy_from_slice(&byte_count.to_le_bytes());
        p[4..8].copy_from_slice(&address.to_le_bytes());
        p[16..20].copy_from_slice(&lbn.to_le_bytes());
        p
    }

    /// Queue commands, ring the doorbell, wait for the poll cycle to finish,
    /// and return the responses posted so far.
    fn run_commands(server: &Server<TestPort>, commands: Arc<Mutex<VecDeque<Message>>>,
                    responses: Arc<Mutex<Vec<Message>>>, msgs: Vec<Message>) -> Vec<Message> {
        commands.lock().unwrap().extend(msgs);
        server.init_polling();
        server.wait_idle();
        let r = responses.lock().unwrap().clone();
        responses.lock().unwrap().clear();
        r
    }

    fn online_command(unit: u16, reference: u32) -> Message {
        Message::command(opcode::ONLINE, unit, reference, 0, &[0; 24])
    }

    #[test]
    fn test_credit_flow() {
        // INIT_CREDITS=16, MAX_CREDITS=14: the first sequential response
        // grants 15, the second 3, the third just the 1 for the response.
        let port = TestPort::new(vec![Drive::new(test_drive_type(), 1)]);
        let (commands, responses) = (port.commands.clone(), port.responses.clone());
        let server = Server::new(ServerKind::Disk, port);

        let r = run_commands(&server, commands.clone(), responses.clone(),
                             vec![Message::command(opcode::GET_UNIT_STATUS, 0, 1, 0, &[])]);
        assert_eq!(15, r[0].credits);
        assert_eq!(2, server.credits());

        let r = run_commands(&server, commands.clone(), responses.clone(),
                             vec![Message::command(opcode::GET_UNIT_STATUS, 0, 2, 0, &[])]);
        assert_eq!(3, r[0].credits);
        assert_eq!(0, server.credits());

        let r = run_commands(&server, commands.clone(), responses.clone(),
                             vec![Message::command(opcode::GET_UNIT_STATUS, 0, 3, 0, &[])]);
        assert_eq!(1, r[0].credits);
        assert_eq!(0, server.credits());
    }

    #[test]
    fn test_endcode_always_has_end_set() {
        let port = TestPort::new(vec![attached_drive()]);
        let (commands, responses) = (port.commands.clone(), port.responses.clone());
        let server = Server::new(ServerKind::Disk, port);

        let r = run_commands(&server, commands.clone(), responses.clone(), vec![
            online_command(0, 1),
            Message::command(opcode::ABORT, 0, 2, 0, &[]),
            Message::command(0xff, 0, 3, 0, &[]),
        ]);
        for resp in &r {
            assert!(resp.endcode() & opcode::END != 0, "END set on every response");
        }
        assert_eq!(opcode::END | opcode::ONLINE, r[0].endcode());
        assert_eq!(opcode::END | opcode::ABORT, r[1].endcode());
        assert_eq!(opcode::END, r[2].endcode(), "protocol error endcode carries no opcode bits");
    }

    #[test]
    fn test_protocol_error_subcode() {
        let port = TestPort::new(vec![attached_drive()]);
        let (commands, responses) = (port.commands.clone(), port.responses.clone());
        let server = Server::new(ServerKind::Disk, port);

        let r = run_commands(&server, commands.clone(), responses.clone(),
                             vec![Message::command(0xff, 0, 1, 0, &[])]);
        // Subcode points at Word3 inside the control message.
        assert_eq!((WORD3_OFFSET as u16 + HEADER_OFFSET) << 5 | status::INVALID_COMMAND, r[0].end_status());
        assert_eq!(0, r[0].end_flags());
    }

    #[test]
    fn test_transfer_validation() {
        let port = TestPort::new(vec![attached_drive()]);
        let (commands, responses) = (port.commands.clone(), port.responses.clone());
        let server = Server::new(ServerKind::Disk, port);

        let r = run_commands(&server, commands.clone(), responses.clone(), vec![
            online_command(0, 1),
            // LBN 200 is past block_count (100) + rct (4)
            Message::command(opcode::READ, 0, 2, 0, &rwe_params(512, 0x1000, 200)),
            // Byte count doesn't fit in the blocks left from LBN 99
            Message::command(opcode::READ, 0, 3, 0, &rwe_params(3 * 512, 0x1000, 99)),
            // RCT access must be exactly one block
            Message::command(opcode::READ, 0, 4, 0, &rwe_params(1024, 0x1000, 101)),
        ]);
        assert_eq!((P_LBN as u16 + HEADER_OFFSET) << 5 | status::INVALID_COMMAND, r[1].end_status());
        assert_eq!((P_BYTE_COUNT as u16 + HEADER_OFFSET) << 5 | status::INVALID_COMMAND, r[2].end_status());
        assert_eq!((P_BYTE_COUNT as u16 + HEADER_OFFSET) << 5 | status::INVALID_COMMAND, r[3].end_status());
    }

    #[test]
    fn test_unit_gates() {
        let mut offline = Drive::new(test_drive_type(), 2);
        offline.attach_image(Box::new(FlatImage::new(100))).unwrap(); // available, not online
        let port = TestPort::new(vec![Drive::new(test_drive_type(), 1), offline]);
        let (commands, responses) = (port.commands.clone(), port.responses.clone());
        let server = Server::new(ServerKind::Disk, port);

        let r = run_commands(&server, commands.clone(), responses.clone(), vec![
            Message::command(opcode::READ, 0, 1, 0, &rwe_params(512, 0x1000, 0)), // no image
            Message::command(opcode::READ, 1, 2, 0, &rwe_params(512, 0x1000, 0)), // available but not online
            Message::command(opcode::READ, 9, 3, 0, &rwe_params(512, 0x1000, 0)), // no such unit
        ]);
        assert_eq!(subcode::UNIT_UNKNOWN << 5 | status::UNIT_OFFLINE, r[0].end_status());
        assert_eq!(status::UNIT_AVAILABLE, r[1].end_status());
        assert_eq!(subcode::UNIT_UNKNOWN << 5 | status::UNIT_OFFLINE, r[2].end_status());
    }

    #[test]
    fn test_rct_read_back() {
        let port = TestPort::new(vec![attached_drive()]);
        let (commands, responses, memory) = (port.commands.clone(), port.responses.clone(), port.memory.clone());
        memory.lock().unwrap()[0x1000..0x1200].fill(0xee);
        let server = Server::new(ServerKind::Disk, port);

        // LBN 101 is RCT block 1: reads back zero filled on first access.
        let r = run_commands(&server, commands.clone(), responses.clone(), vec![
            online_command(0, 1),
            Message::command(opcode::READ, 0, 2, 0, &rwe_params(512, 0x1000, 101)),
        ]);
        assert_eq!(status::SUCCESS, r[1].end_status());
        assert_eq!(vec![0u8; 512], memory.lock().unwrap()[0x1000..0x1200].to_vec());

        // Write a pattern to RCT block 1 and read it back.
        memory.lock().unwrap()[0x2000..0x2200].fill(0x77);
        let r = run_commands(&server, commands.clone(), responses.clone(), vec![
            Message::command(opcode::WRITE, 0, 3, 0, &rwe_params(512, 0x2000, 101)),
            Message::command(opcode::READ, 0, 4, 0, &rwe_params(512, 0x3000, 101)),
        ]);
        assert_eq!(status::SUCCESS, r[0].end_status());
        assert_eq!(status::SUCCESS, r[1].end_status());
        assert_eq!(vec![0x77u8; 512], memory.lock().unwrap()[0x3000..0x3200].to_vec());
    }

    #[test]
    fn test_write_then_read_data() {
        let port = TestPort::new(vec![attached_drive()]);
        let (commands, responses, memory) = (port.commands.clone(), port.responses.clone(), port.memory.clone());
        for (i, b) in memory.lock().unwrap()[0x400..0x800].iter_mut().enumerate() {
            *b = (i & 0xff) as u8;
        }
        let server = Server::new(ServerKind::Disk, port);

        let r = run_commands(&server, commands.clone(), responses.clone(), vec![
            online_command(0, 1),
            Message::command(opcode::WRITE, 0, 2, 0, &rwe_params(1024, 0x400, 10)),
            Message::command(opcode::READ, 0, 3, 0, &rwe_params(1024, 0x4000, 10)),
        ]);
        assert_eq!(status::SUCCESS, r[1].end_status());
        assert_eq!(0, r[1].param_u32(P_LBN), "first bad block reads zero");
        assert_eq!(status::SUCCESS, r[2].end_status());
        let mem = memory.lock().unwrap();
        assert_eq!(mem[0x400..0x800], mem[0x4000..0x4400]);
        drop(mem);

        server.with_port(|port| {
            assert_eq!((0..0x400).map(|i| (i & 0xff) as u8).collect::<Vec<u8>>(),
                       port.drives[0].read(10, 1024).unwrap());
        });
    }

    #[test]
    fn test_access_erase_and_status_commands() {
        let port = TestPort::new(vec![attached_drive()]);
        let (commands, responses) = (port.commands.clone(), port.responses.clone());
        let server = Server::new(ServerKind::Disk, port);

        // put something on the disk for ERASE to clear
        server.with_port(|port| port.drives[0].write(3, &vec![0xaa; 512]).unwrap());

        let r = run_commands(&server, commands.clone(), responses.clone(), vec![
            online_command(0, 1),
            Message::command(opcode::ACCESS, 0, 2, 0, &rwe_params(1024, 0, 3)),
            Message::command(opcode::ERASE, 0, 3, 0, &rwe_params(512, 0, 3)),
            Message::command(opcode::GET_COMMAND_STATUS, 0, 4, 0, &[0; 4]),
            Message::command(opcode::DETERMINE_ACCESS_PATHS, 0, 5, 0, &[]),
            Message::command(opcode::REPLACE, 0, 6, 0, &[]),
        ]);
        assert_eq!(status::SUCCESS, r[1].end_status(), "ACCESS read-verifies without a transfer");
        assert_eq!(status::SUCCESS, r[2].end_status());
        server.with_port(|port| assert_eq!(vec![0u8; 512], port.drives[0].read(3, 512).unwrap(),
                                           "ERASE zeroes the blocks"));
        assert_eq!(status::SUCCESS, r[3].end_status());
        assert_eq!(24, r[3].message_length(), "GET COMMAND STATUS response carries 8 parameter bytes");
        assert_eq!(0, r[3].param_u32(0));
        assert_eq!(0, r[3].param_u32(4));
        assert_eq!(status::SUCCESS, r[4].end_status());
        assert_eq!(status::SUCCESS, r[5].end_status());
        assert_eq!(16, r[5].message_length(), "REPLACE response has no parameters");
    }

    #[test]
    fn test_compare_host_data() {
        let port = TestPort::new(vec![attached_drive()]);
        let (commands, responses, memory) = (port.commands.clone(), port.responses.clone(), port.memory.clone());
        let server = Server::new(ServerKind::Disk, port);

        // Image block 5 is zero; host memory at 0x800 is zero: equal.
        let r = run_commands(&server, commands.clone(), responses.clone(), vec![
            online_command(0, 1),
            Message::command(opcode::COMPARE_HOST_DATA, 0, 2, 0, &rwe_params(512, 0x800, 5)),
        ]);
        assert_eq!(status::SUCCESS, r[1].end_status(), "equal data compares clean");

        memory.lock().unwrap()[0x900] = 1;
        let r = run_commands(&server, commands.clone(), responses.clone(), vec![
            Message::command(opcode::COMPARE_HOST_DATA, 0, 3, 0, &rwe_params(512, 0x800, 5)),
        ]);
        assert_eq!(status::COMPARE_ERROR, r[0].end_status(), "mismatch is a compare error");
    }

    /// An image backend whose medium has gone bad: every access errors.
    struct BrokenImage;

    impl crate::block::BlockDevice for BrokenImage {
        fn blocks(&self) -> usize { 100 }
        fn get_bytes(&self, _offset: usize, _count: usize) -> anyhow::Result<Vec<u8>> {
            Err(anyhow::anyhow!("media error"))
        }
        fn set_bytes(&mut self, _offset: usize, _buf: &[u8]) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("media error"))
        }
    }

    #[test]
    fn test_backing_image_failure() {
        let mut drive = Drive::new(test_drive_type(), 1);
        drive.attach_image(Box::new(BrokenImage)).unwrap();
        let port = TestPort::new(vec![drive]);
        let (commands, responses) = (port.commands.clone(), port.responses.clone());
        let server = Server::new(ServerKind::Disk, port);

        let r = run_commands(&server, commands.clone(), responses.clone(), vec![
            online_command(0, 1),
            Message::command(opcode::READ, 0, 2, 0, &rwe_params(512, 0x1000, 0)),
            Message::command(opcode::WRITE, 0, 3, 0, &rwe_params(512, 0x1000, 0)),
        ]);
        assert_eq!(status::SUCCESS, r[0].end_status(), "ONLINE never touches the medium");
        assert_eq!(status::DRIVE_ERROR, r[1].end_status());
        assert_eq!(status::DRIVE_ERROR, r[2].end_status());
    }

    #[test]
    fn test_dma_fault() {
        let mut port = TestPort::new(vec![attached_drive()]);
        port.fail_dma = true;
        let (commands, responses) = (port.commands.clone(), port.responses.clone());
        let server = Server::new(ServerKind::Disk, port);

        let r = run_commands(&server, commands.clone(), responses.clone(), vec![
            online_command(0, 1),
            Message::command(opcode::READ, 0, 2, 0, &rwe_params(512, 0x1000, 0)),
            Message::command(opcode::WRITE, 0, 3, 0, &rwe_params(512, 0x1000, 0)),
        ]);
        assert_eq!(subcode::NXM << 5 | status::HOST_BUFFER_ACCESS_ERROR, r[1].end_status());
        assert_eq!(subcode::NXM << 5 | status::HOST_BUFFER_ACCESS_ERROR, r[2].end_status());
    }

    #[test]
    fn test_available_releases_unit() {
        let port = TestPort::new(vec![attached_drive()]);
        let (commands, responses) = (port.commands.clone(), port.responses.clone());
        let server = Server::new(ServerKind::Disk, port);

        let r = run_commands(&server, commands.clone(), responses.clone(), vec![
            online_command(0, 1),
            Message::command(opcode::AVAILABLE, 0, 2, 0, &[]),
        ]);
        assert_eq!(subcode::NORMAL << 5 | status::SUCCESS, r[0].end_status());
        assert_eq!(subcode::STILL_CONNECTED << 5 | status::SUCCESS, r[1].end_status());
        server.with_port(|port| assert!(!port.drives[0].is_online()));

        // Second ONLINE reports ALREADY_ONLINE via the subcode.
        let r = run_commands(&server, commands.clone(), responses.clone(), vec![
            online_command(0, 3),
            online_command(0, 4),
        ]);
        assert_eq!(subcode::NORMAL << 5 | status::SUCCESS, r[0].end_status());
        assert_eq!(subcode::ALREADY_ONLINE << 5 | status::SUCCESS, r[1].end_status());
        assert_eq!(100, r[1].param_u32(24), "unit size is the block count");
    }

    #[test]
    fn test_set_controller_characteristics() {
        let port = TestPort::new(vec![attached_drive()]);
        let (commands, responses) = (port.commands.clone(), port.responses.clone());
        let server = Server::new(ServerKind::Disk, port);

        let mut params = [0u8; 16];
        params[2..4].copy_from_slice(&0x4d_u16.to_le_bytes()); // controller flags, bit 0 set
        params[4..6].copy_from_slice(&60_u16.to_le_bytes());   // host timeout
        let r = run_commands(&server, commands.clone(), responses.clone(), vec![
            Message::command(opcode::SET_CONTROLLER_CHARACTERISTICS, 0, 1, 0, &params),
        ]);
        assert_eq!(status::SUCCESS, r[0].end_status());
        assert_eq!(0x4c, r[0].param_u16(2), "576 byte sector bit masked off");
        assert_eq!(0xff, r[0].param_u16(4), "controller timeout maxed");
        assert_eq!(0x00000642, r[0].param_u32(8));
        assert_eq!(0x0102, r[0].param_u16(14));
        assert_eq!(60, server.host_timeout());
        assert_eq!(0x4d, server.controller_flags());

        // Non-zero MSCP version is an invalid command.
        let mut params = [0u8; 16];
        params[0..2].copy_from_slice(&1_u16.to_le_bytes());
        let r = run_commands(&server, commands.clone(), responses.clone(), vec![
            Message::command(opcode::SET_CONTROLLER_CHARACTERISTICS, 0, 2, 0, &params),
        ]);
        assert_eq!(status::INVALID_COMMAND, r[0].end_status());
    }

    #[test]
    fn test_get_unit_status_next_unit_coercion() {
        let port = TestPort::new(vec![attached_drive()]);
        let (commands, responses) = (port.commands.clone(), port.responses.clone());
        let server = Server::new(ServerKind::Disk, port);

        let r = run_commands(&server, commands.clone(), responses.clone(), vec![
            Message::command(opcode::GET_UNIT_STATUS, 57, 1, 0x1, &[]),
        ]);
        assert_eq!(0, r[0].unit_number(), "out of range next-unit query coerces to unit 0");
        assert_eq!(status::UNIT_AVAILABLE, r[0].end_status());
        assert_eq!(0x25644099, r[0].param_u32(16), "media type identifier");
        assert_eq!(10, r[0].param_u16(24), "track size");
        assert_eq!(4, r[0].param_u16(32), "RCT size");
    }

    #[test]
    fn test_tape_variant_dispatch() {
        let port = TestPort::new(vec![attached_drive()]);
        let (commands, responses) = (port.commands.clone(), port.responses.clone());
        let server = Server::new(ServerKind::Tape, port);

        let r = run_commands(&server, commands.clone(), responses.clone(), vec![
            online_command(0, 1),
            Message::command(opcode::WRITE_TAPE_MARK, 0, 2, 0, &[]),
            Message::command(opcode::REPOSITION, 0, 3, 0, &[0; 12]),
            Message::command(opcode::REPLACE, 0, 4, 0, &[]), // disk-only: protocol error on tape
        ]);
        assert_eq!(status::SUCCESS, r[1].end_status());
        assert_eq!(opcode::END | opcode::WRITE_TAPE_MARK, r[1].endcode());
        assert_eq!(status::SUCCESS, r[2].end_status());
        assert_eq!(opcode::END, r[3].endcode());
        assert_eq!((WORD3_OFFSET as u16 + HEADER_OFFSET) << 5 | status::INVALID_COMMAND, r[3].end_status());
    }

    #[test]
    fn test_ring_error_drops_queue() {
        let mut port = TestPort::new(vec![attached_drive()]);
        port.ring_error = true;
        let (commands, responses) = (port.commands.clone(), port.responses.clone());
        let server = Server::new(ServerKind::Disk, port);

        commands.lock().unwrap().push_back(Message::command(opcode::ABORT, 0, 1, 0, &[]));
        server.init_polling();
        server.wait_idle();
        assert!(responses.lock().unwrap().is_empty(), "ring error drops everything");
    }

    #[test]
    fn test_reset_during_run() {
        // Two commands are drained; the first blocks in DMA while we issue
        // the reset. The in-flight command completes, the queued one is
        // abandoned, drives go offline and the credit bank refills.
        let mut port = TestPort::new(vec![attached_drive()]);
        let (entered_tx, entered_rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel();
        port.dma_entered = Some(entered_tx);
        port.dma_gate = Some(gate_rx);
        let (commands, responses) = (port.commands.clone(), port.responses.clone());
        let server = Arc::new(Server::new(ServerKind::Disk, port));

        commands.lock().unwrap().push_back(online_command(0, 1));
        commands.lock().unwrap().push_back(Message::command(opcode::READ, 0, 2, 0, &rwe_params(512, 0x1000, 0)));
        commands.lock().unwrap().push_back(Message::command(opcode::READ, 0, 3, 0, &rwe_params(512, 0x1000, 1)));
        server.init_polling();

        // Wait until the thread is inside the first READ's dma_write.
        entered_rx.recv_timeout(Duration::from_secs(10)).expect("thread entered DMA");

        let resetter = {
            let server = server.clone();
            std::thread::spawn(move || server.reset())
        };
        // The reset can't proceed until the in-flight command finishes.
        std::thread::sleep(Duration::from_millis(50));
        assert!(!resetter.is_finished(), "reset blocks while a command is executing");

        gate_tx.send(()).unwrap(); // let the READ finish
        resetter.join().unwrap();

        let r = responses.lock().unwrap().clone();
        assert_eq!(2, r.len(), "ONLINE and the first READ completed; the second READ was abandoned");
        assert_eq!(opcode::END | opcode::READ, r[1].endcode());
        assert_eq!(INIT_CREDITS, server.credits());
        server.with_port(|port| assert!(!port.drives[0].is_online(), "reset forces drives offline"));
    }
}
