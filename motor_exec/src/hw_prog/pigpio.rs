//! # pigpio daemon engine
//!
//! Talks to `pigpiod` over its socket interface. Every command is a 16 byte little endian header
//! `cmd, p1, p2, p3` optionally followed by `p3` bytes of extension. The daemon answers with the
//! same header where the last word is the result, negative on error.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, info};
use std::io::{Cursor, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use super::engine::{EngineError, ProgramId, RunState, TimingEngine};
use super::isa::NUM_PARAMS;
use super::program::Program;

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Default daemon address.
pub const DEFAULT_ADDRESS: &str = "127.0.0.1:8888";

/// Store a script.
const PI_CMD_PROC: u32 = 38;
/// Delete a script.
const PI_CMD_PROCD: u32 = 39;
/// Run a script.
const PI_CMD_PROCR: u32 = 40;
/// Script status.
const PI_CMD_PROCP: u32 = 45;

/// Time allowed for a freshly stored script to leave the initialising state.
const INIT_TIMEOUT: Duration = Duration::from_millis(500);

const IO_TIMEOUT: Duration = Duration::from_secs(2);

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

pub struct PigpioEngine {
    stream: TcpStream,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl PigpioEngine {
    /// Connect to the daemon.
    pub fn connect<A: ToSocketAddrs + std::fmt::Debug>(addr: A) -> Result<Self, EngineError> {
        let stream = TcpStream::connect(&addr)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(IO_TIMEOUT))?;
        stream.set_write_timeout(Some(IO_TIMEOUT))?;

        info!("Connected to pigpiod at {:?}", addr);

        Ok(Self { stream })
    }

    /// Send a command and return the daemon's result word.
    fn command(&mut self, cmd: u32, p1: u32, p2: u32, ext: &[u8]) -> Result<i32, EngineError> {
        self.stream.write_all(&encode_request(cmd, p1, p2, ext)?)?;

        let mut resp = [0u8; 16];
        self.stream.read_exact(&mut resp)?;

        decode_response(cmd, &resp)
    }
}

impl TimingEngine for PigpioEngine {
    fn store(&mut self, program: &Program) -> Result<ProgramId, EngineError> {
        let script = program.to_script();
        let id = self.command(PI_CMD_PROC, 0, 0, script.as_bytes())? as ProgramId;

        debug!("pigpiod stored script {} ({} bytes)", id, script.len());

        // The daemon compiles the script asynchronously
        let deadline = std::time::Instant::now() + INIT_TIMEOUT;
        loop {
            match self.status(id)? {
                RunState::Initialising => {
                    if std::time::Instant::now() >= deadline {
                        return Err(EngineError::InitTimeout(id));
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                RunState::Failed => {
                    return Err(EngineError::Daemon {
                        cmd: PI_CMD_PROC,
                        code: RunState::Failed as i32,
                    })
                }
                _ => return Ok(id),
            }
        }
    }

    fn run(&mut self, id: ProgramId, params: &[i32]) -> Result<(), EngineError> {
        if params.len() > NUM_PARAMS {
            return Err(EngineError::TooManyParams(params.len()));
        }

        let mut ext = Vec::with_capacity(4 * params.len());
        for p in params {
            ext.write_i32::<LittleEndian>(*p)?;
        }

        self.command(PI_CMD_PROCR, id, 0, &ext)?;
        Ok(())
    }

    fn status(&mut self, id: ProgramId) -> Result<RunState, EngineError> {
        let len = self.command(PI_CMD_PROCP, id, 0, &[])?;

        // Extended response: status followed by the script's parameters
        let mut ext = vec![0u8; len as usize];
        self.stream.read_exact(&mut ext)?;

        parse_status(&ext)
    }

    fn delete(&mut self, id: ProgramId) -> Result<(), EngineError> {
        self.command(PI_CMD_PROCD, id, 0, &[])?;
        debug!("pigpiod deleted script {}", id);
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn encode_request(cmd: u32, p1: u32, p2: u32, ext: &[u8]) -> Result<Vec<u8>, EngineError> {
    let mut buf = Vec::with_capacity(16 + ext.len());
    buf.write_u32::<LittleEndian>(cmd)?;
    buf.write_u32::<LittleEndian>(p1)?;
    buf.write_u32::<LittleEndian>(p2)?;
    buf.write_u32::<LittleEndian>(ext.len() as u32)?;
    buf.extend_from_slice(ext);
    Ok(buf)
}

fn decode_response(cmd: u32, resp: &[u8; 16]) -> Result<i32, EngineError> {
    let mut rdr = Cursor::new(&resp[..]);
    let echoed = rdr.read_u32::<LittleEndian>()?;
    let _p1 = rdr.read_u32::<LittleEndian>()?;
    let _p2 = rdr.read_u32::<LittleEndian>()?;
    let res = rdr.read_i32::<LittleEndian>()?;

    if echoed != cmd {
        return Err(EngineError::Daemon { cmd, code: -1 });
    }
    if res < 0 {
        return Err(EngineError::Daemon { cmd, code: res });
    }

    Ok(res)
}

fn parse_status(ext: &[u8]) -> Result<RunState, EngineError> {
    let code = Cursor::new(ext).read_i32::<LittleEndian>()?;
    RunState::from_code(code).ok_or(EngineError::UnknownStatus(code))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hw_prog::{HardwareTimingProgram, HwProgParams};
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_request_layout() {
        let buf = encode_request(PI_CMD_PROCR, 3, 0, &[1, 2, 3, 4]).unwrap();
        assert_eq!(
            buf,
            vec![40, 0, 0, 0, 3, 0, 0, 0, 0, 0, 0, 0, 4, 0, 0, 0, 1, 2, 3, 4]
        );
    }

    #[test]
    fn test_response_errors() {
        let mut resp = [0u8; 16];
        resp[0] = 38;
        resp[12..].copy_from_slice(&(-48i32).to_le_bytes());
        assert!(matches!(
            decode_response(PI_CMD_PROC, &resp),
            Err(EngineError::Daemon { cmd: 38, code: -48 })
        ));

        resp[12..].copy_from_slice(&7i32.to_le_bytes());
        assert_eq!(decode_response(PI_CMD_PROC, &resp).unwrap(), 7);
    }

    /// Minimal stand-in daemon answering store, status, run and delete.
    fn fake_daemon(listener: TcpListener) -> Vec<(u32, u32, Vec<u8>)> {
        let (mut sock, _) = listener.accept().unwrap();
        let mut seen = Vec::new();

        loop {
            let mut hdr = [0u8; 16];
            if sock.read_exact(&mut hdr).is_err() {
                break;
            }
            let mut rdr = Cursor::new(&hdr[..]);
            let cmd = rdr.read_u32::<LittleEndian>().unwrap();
            let p1 = rdr.read_u32::<LittleEndian>().unwrap();
            let _p2 = rdr.read_u32::<LittleEndian>().unwrap();
            let p3 = rdr.read_u32::<LittleEndian>().unwrap();
            let mut ext = vec![0u8; p3 as usize];
            sock.read_exact(&mut ext).unwrap();

            let (res, extra): (i32, Vec<u8>) = match cmd {
                PI_CMD_PROC => (5, vec![]),
                PI_CMD_PROCP => {
                    let mut e = Vec::new();
                    e.write_i32::<LittleEndian>(RunState::Halted as i32).unwrap();
                    for _ in 0..NUM_PARAMS {
                        e.write_i32::<LittleEndian>(0).unwrap();
                    }
                    (e.len() as i32, e)
                }
                _ => (0, vec![]),
            };

            let mut out = Vec::new();
            out.write_u32::<LittleEndian>(cmd).unwrap();
            out.write_u32::<LittleEndian>(p1).unwrap();
            out.write_u32::<LittleEndian>(0).unwrap();
            out.write_i32::<LittleEndian>(res).unwrap();
            out.extend_from_slice(&extra);
            sock.write_all(&out).unwrap();

            seen.push((cmd, p1, ext));
        }

        seen
    }

    #[test]
    fn test_session_against_fake_daemon() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let daemon = thread::spawn(move || fake_daemon(listener));

        let prog = HardwareTimingProgram::new().unwrap();
        let params = HwProgParams::new(300.0, 1000.0, 0.5, 24).unwrap();

        {
            let mut engine = PigpioEngine::connect(addr).unwrap();
            let id = engine.store(prog.program()).unwrap();
            assert_eq!(id, 5);
            engine.run(id, &params.to_array()).unwrap();
            assert_eq!(engine.status(id).unwrap(), RunState::Halted);
            engine.delete(id).unwrap();
        }

        let seen = daemon.join().unwrap();
        let cmds: Vec<u32> = seen.iter().map(|(c, _, _)| *c).collect();
        assert_eq!(
            cmds,
            vec![
                PI_CMD_PROC,
                PI_CMD_PROCP,
                PI_CMD_PROCR,
                PI_CMD_PROCP,
                PI_CMD_PROCD
            ]
        );

        // Script text is sent verbatim
        assert_eq!(seen[0].2, prog.script().into_bytes());

        // Run parameters as little endian words
        let mut expected = Vec::new();
        for p in params.to_array().iter() {
            expected.write_i32::<LittleEndian>(*p).unwrap();
        }
        assert_eq!(seen[2].1, 5);
        assert_eq!(seen[2].2, expected);
    }
}
