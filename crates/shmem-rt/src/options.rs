//! The option set recognized by the runtime and its effects.
//!
//! An outer CLI collaborator owns the actual command line; it forwards the
//! argument vector here. Parsing stops at the first non-option argument and
//! reports how many arguments were consumed, so the application can pick up
//! its own options afterwards.

use crate::config::{InternalConfig, ProcType, BASE_VIRTADDR_ALIGN, MAX_NUMA_NODES};
use crate::RtError;
use log::LevelFilter;

/// `--socket-mem` argument length cap.
const SOCKET_MEM_STRLEN: usize = MAX_NUMA_NODES * 10;

/// Outcome of a successful parse.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParseResult {
    /// Number of consumed arguments (program name excluded).
    pub consumed: usize,
    /// `-h`/`--help` was given.
    pub help: bool,
    /// `-v` was given.
    pub version: bool,
}

/// Maps a syslog facility name to its numeric value.
pub fn syslog_facility(name: &str) -> Option<i32> {
    Some(match name {
        "auth" => libc::LOG_AUTH,
        "cron" => libc::LOG_CRON,
        "daemon" => libc::LOG_DAEMON,
        "ftp" => libc::LOG_FTP,
        "kern" => libc::LOG_KERN,
        "lpr" => libc::LOG_LPR,
        "mail" => libc::LOG_MAIL,
        "news" => libc::LOG_NEWS,
        "syslog" => libc::LOG_SYSLOG,
        "user" => libc::LOG_USER,
        "uucp" => libc::LOG_UUCP,
        "local0" => libc::LOG_LOCAL0,
        "local1" => libc::LOG_LOCAL1,
        "local2" => libc::LOG_LOCAL2,
        "local3" => libc::LOG_LOCAL3,
        "local4" => libc::LOG_LOCAL4,
        "local5" => libc::LOG_LOCAL5,
        "local6" => libc::LOG_LOCAL6,
        "local7" => libc::LOG_LOCAL7,
        _ => return None,
    })
}

/// Numeric log level (1 = emergency .. 8 = debug) to the facade's filter.
fn level_filter(level: u32) -> Option<LevelFilter> {
    Some(match level {
        1..=4 => LevelFilter::Error,
        5 => LevelFilter::Warn,
        6 | 7 => LevelFilter::Info,
        8 => LevelFilter::Debug,
        _ => return None,
    })
}

fn parse_log_level(cfg: &mut InternalConfig, arg: &str) -> Result<(), RtError> {
    let (pattern, level) = match arg.split_once(',') {
        Some((pat, lvl)) => (Some(pat.to_owned()), lvl),
        None => (None, arg),
    };
    let level: u32 = level
        .parse()
        .map_err(|_| RtError::invalid(format!("bad log level {arg:?}")))?;
    let filter =
        level_filter(level).ok_or_else(|| RtError::invalid(format!("bad log level {arg:?}")))?;
    cfg.log_levels.push((pattern, filter));
    Ok(())
}

fn parse_socket_mem(cfg: &mut InternalConfig, arg: &str) -> Result<(), RtError> {
    if arg.len() >= SOCKET_MEM_STRLEN {
        return Err(RtError::invalid("--socket-mem is too long"));
    }
    if !arg.chars().last().is_some_and(|c| c.is_ascii_digit()) {
        return Err(RtError::invalid(format!("bad --socket-mem {arg:?}")));
    }
    let mut total: u64 = 0;
    let mut mem = [0u64; MAX_NUMA_NODES];
    for (idx, part) in arg.split(',').enumerate() {
        if idx >= MAX_NUMA_NODES {
            return Err(RtError::invalid(format!(
                "--socket-mem names more than {MAX_NUMA_NODES} sockets"
            )));
        }
        let mb: u64 = part
            .parse()
            .map_err(|_| RtError::invalid(format!("bad --socket-mem {arg:?}")))?;
        mem[idx] = mb * 1024 * 1024;
        total += mem[idx];
    }
    if total == 0 {
        return Err(RtError::invalid("--socket-mem requests zero memory"));
    }
    cfg.socket_mem = mem;
    cfg.force_sockets = true;
    Ok(())
}

fn parse_base_virtaddr(cfg: &mut InternalConfig, arg: &str) -> Result<(), RtError> {
    let digits = arg.strip_prefix("0x").or_else(|| arg.strip_prefix("0X")).unwrap_or(arg);
    let addr = u64::from_str_radix(digits, 16)
        .map_err(|_| RtError::invalid(format!("bad --base-virtaddr {arg:?}")))?;
    // Align up to the largest minimum huge page size so the hint is usable
    // on every supported platform.
    cfg.base_virtaddr =
        (addr.next_multiple_of(BASE_VIRTADDR_ALIGN)) as usize;
    Ok(())
}

fn parse_uint(name: &str, arg: &str) -> Result<u64, RtError> {
    arg.parse()
        .map_err(|_| RtError::invalid(format!("bad {name} value {arg:?}")))
}

/// Parses the recognized options into `cfg`.
///
/// `args` excludes the program name. Returns how many arguments were
/// consumed; the first unrecognized non-option stops the scan.
pub fn parse(cfg: &mut InternalConfig, args: &[String]) -> Result<ParseResult, RtError> {
    type Args<'a> = std::iter::Peekable<std::iter::Enumerate<std::slice::Iter<'a, String>>>;

    fn value(it: &mut Args<'_>, opt: &str) -> Result<String, RtError> {
        it.next()
            .map(|(_, v)| v.clone())
            .ok_or_else(|| RtError::invalid(format!("option {opt} requires a value")))
    }

    let mut out = ParseResult::default();
    let mut it: Args<'_> = args.iter().enumerate().peekable();

    while let Some(&(_, arg)) = it.peek() {
        if !arg.starts_with('-') {
            break;
        }
        it.next();
        match arg.as_str() {
            "-h" | "--help" => out.help = true,
            "-v" => out.version = true,
            "-m" => {
                let mb = parse_uint("-m", &value(&mut it, "-m")?)?;
                cfg.memory = mb * 1024 * 1024;
            }
            "-n" => {
                let n = parse_uint("-n", &value(&mut it, "-n")?)?;
                if n == 0 {
                    return Err(RtError::invalid("channel count must be >= 1"));
                }
                cfg.force_nchannel = n as u32;
            }
            "-r" => {
                let r = parse_uint("-r", &value(&mut it, "-r")?)?;
                if r == 0 || r > 16 {
                    return Err(RtError::invalid("rank count must be in 1..=16"));
                }
                cfg.force_nrank = r as u32;
            }
            "--master-lcore" => {
                let id = parse_uint("--master-lcore", &value(&mut it, "--master-lcore")?)?;
                cfg.master_lcore = Some(id as u32);
            }
            "--proc-type" => {
                cfg.process_type = match value(&mut it, "--proc-type")?.as_str() {
                    "primary" => ProcType::Primary,
                    "secondary" => ProcType::Secondary,
                    "auto" => ProcType::Auto,
                    other => {
                        return Err(RtError::invalid(format!("bad --proc-type {other:?}")))
                    }
                };
            }
            "--no-huge" => cfg.no_hugetlbfs = true,
            "--huge-dir" => cfg.hugepage_dir = Some(value(&mut it, "--huge-dir")?.into()),
            "--huge-unlink" => cfg.hugepage_unlink = true,
            "--file-prefix" => {
                let prefix = value(&mut it, "--file-prefix")?;
                if prefix.contains('%') {
                    return Err(RtError::invalid("--file-prefix must not contain '%'"));
                }
                cfg.file_prefix = prefix;
            }
            "--socket-mem" => parse_socket_mem(cfg, &value(&mut it, "--socket-mem")?)?,
            "--base-virtaddr" => parse_base_virtaddr(cfg, &value(&mut it, "--base-virtaddr")?)?,
            "--log-level" => parse_log_level(cfg, &value(&mut it, "--log-level")?)?,
            "--syslog" => {
                let name = value(&mut it, "--syslog")?;
                cfg.syslog_facility = syslog_facility(&name)
                    .ok_or_else(|| RtError::invalid(format!("bad --syslog facility {name:?}")))?;
            }
            unknown => {
                return Err(RtError::invalid(format!("unknown option {unknown:?}")));
            }
        }
        out.consumed = it.peek().map_or(args.len(), |&(i, _)| i);
    }

    check(cfg)?;
    Ok(out)
}

/// Cross-option constraint checks.
pub(crate) fn check(cfg: &InternalConfig) -> Result<(), RtError> {
    if cfg.memory != 0 && cfg.force_sockets {
        return Err(RtError::invalid(
            "-m and --socket-mem cannot be used together",
        ));
    }
    if cfg.no_hugetlbfs && cfg.force_sockets {
        return Err(RtError::invalid(
            "--no-huge and --socket-mem cannot be used together",
        ));
    }
    if cfg.no_hugetlbfs && cfg.hugepage_unlink {
        return Err(RtError::invalid(
            "--no-huge and --huge-unlink cannot be used together",
        ));
    }
    Ok(())
}

/// Applies the parsed global log levels to the facade.
pub(crate) fn apply_log_levels(cfg: &InternalConfig) {
    for (pattern, filter) in &cfg.log_levels {
        if pattern.is_none() {
            log::set_max_level(*filter);
        }
        // Per-pattern levels travel with the config for the sink
        // collaborator to honor.
    }
}

/// Usage text, written to standard error by the caller on parse failures.
pub fn usage(prog: &str) -> String {
    format!(
        "usage: {prog} [options]\n\
         \n\
         Runtime options:\n\
         \x20 -m MB                 memory to allocate across sockets\n\
         \x20 -n CHANNELS           force number of memory channels\n\
         \x20 -r RANKS              force number of memory ranks (1..16)\n\
         \x20 --master-lcore ID     lcore id of the master thread\n\
         \x20 --proc-type TYPE      primary|secondary|auto\n\
         \x20 --no-huge             use anonymous memory instead of hugepages\n\
         \x20 --huge-dir DIR        directory of the hugetlbfs mount\n\
         \x20 --huge-unlink         unlink hugepage files after mapping\n\
         \x20 --file-prefix NAME    prefix of the runtime files\n\
         \x20 --socket-mem N0,N1..  memory per socket, in MB\n\
         \x20 --base-virtaddr ADDR  base virtual address (hex)\n\
         \x20 --log-level [RE,]N    global or per-target log level (1..8)\n\
         \x20 --syslog FACILITY     syslog facility for the log sink\n\
         \x20 -v                    display version at startup\n\
         \x20 -h, --help            this help\n"
    )
}
