//! `vmprobe`: trace syscall entries of a simulated VM through the debug core.
//!
//! Boots a simulated machine, publishes it under `VM_NAME`, attaches a
//! session by that name and sets a software breakpoint on the syscall
//! entry point read from `IA32_LSTAR`. Every hit is attributed to the
//! process (page-table root) and vCPU it came from. Before exiting the VM
//! is rewound to the snapshot taken at attach time.
//!
//! # Usage
//!
//! ```bash
//! # Trace for one second with the default two vCPUs and two processes
//! vmprobe guest0
//!
//! # More processes, longer run, machine-readable report
//! vmprobe guest0 --vcpus 4 --processes 8 --seconds 5 --json
//! ```

use std::collections::BTreeMap;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{debug, info, warn};
use serde::Serialize;
use vmprobe_core::{
    AddressSpace, BreakpointRequest, Deadline, Register, Session, StateFlags, StopOrigin,
    Transport, MSR_IA32_LSTAR,
};
use vmprobe_sim::{SimConfig, SimulatedVm};

#[derive(Parser)]
#[command(name = "vmprobe")]
#[command(about = "Trace syscall entries of a simulated VM with the vmprobe debug core")]
#[command(version)]
struct Cli {
    /// Name the VM is published under.
    vm_name: String,

    /// Number of vCPUs.
    #[arg(long, default_value = "2")]
    vcpus: usize,

    /// Number of guest processes.
    #[arg(long, default_value = "2")]
    processes: usize,

    /// How long to trace, in seconds.
    #[arg(long, default_value = "1.0")]
    seconds: f64,

    /// Print the report as JSON instead of text.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Default, Serialize)]
struct TraceReport {
    vm: String,
    vcpus: u32,
    memory_size: u64,
    syscall_entry: u64,
    hits: u64,
    foreign_stops: u64,
    per_vcpu: BTreeMap<u32, u64>,
    per_process: BTreeMap<String, u64>,
    rewound: bool,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(report) => {
            if cli.json {
                match serde_json::to_string_pretty(&report) {
                    Ok(json) => println!("{}", json),
                    Err(e) => {
                        eprintln!("Error: failed to encode report: {}", e);
                        return ExitCode::FAILURE;
                    }
                }
            } else {
                print_report(&report);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<TraceReport, Box<dyn std::error::Error>> {
    if !cli.seconds.is_finite() || cli.seconds < 0.0 {
        return Err(format!("invalid --seconds {}", cli.seconds).into());
    }

    let vm = Arc::new(SimulatedVm::boot(SimConfig {
        vcpus: cli.vcpus,
        processes: cli.processes,
        start_paused: true,
        ..Default::default()
    })?);
    let _publication = Transport::publish(&cli.vm_name, Arc::clone(&vm) as _)?;

    let session = Session::open(&cli.vm_name)?;
    session.init()?;
    let mut report = TraceReport {
        vm: cli.vm_name.clone(),
        vcpus: session.cpu_count()?,
        memory_size: session.physical_memory_size()?,
        ..Default::default()
    };

    let entry = session.read_msr(0, MSR_IA32_LSTAR)?;
    report.syscall_entry = entry;
    info!("syscall entry at {:#x}", entry);

    session.save()?;
    let id = session.set_breakpoint(BreakpointRequest::software(AddressSpace::Virtual, entry))?;
    session.resume()?;

    let deadline = Deadline::after(Duration::from_secs_f64(cli.seconds));
    while let Some(state) = session.wait_for_state_change(&deadline)? {
        if !state.is_paused() {
            continue;
        }
        match StopOrigin::classify(state) {
            StopOrigin::Mine => {
                if let Some(stop) = session.stop_info()? {
                    report.hits += 1;
                    *report.per_vcpu.entry(stop.vcpu).or_default() += 1;
                    *report
                        .per_process
                        .entry(format!("{:#x}", stop.cr3))
                        .or_default() += 1;
                    debug!(
                        "hit on vCPU {} rip={:#x} rax={:#x}",
                        stop.vcpu,
                        stop.rip,
                        session.read_register(stop.vcpu, Register::Rax)?
                    );
                }
            }
            _ => {
                report.foreign_stops += 1;
                warn!("stop not caused by this session: {}", state);
            }
        }
        session.resume()?;
    }

    session.pause()?;
    session.unset_breakpoint(id)?;
    session.restore()?;
    report.rewound = session.get_state()? == StateFlags::PAUSED;
    info!(
        "{} hits in {:.2}s, {} instructions retired",
        report.hits,
        deadline.elapsed().as_secs_f64(),
        vm.retired()
    );
    session.close();
    Ok(report)
}

fn print_report(report: &TraceReport) {
    println!("VM {:?}: {} vCPUs, {} bytes", report.vm, report.vcpus, report.memory_size);
    println!("  syscall entry:  {:#x}", report.syscall_entry);
    println!("  hits:           {}", report.hits);
    println!("  foreign stops:  {}", report.foreign_stops);
    for (vcpu, hits) in &report.per_vcpu {
        println!("  vCPU {:<3}       {}", vcpu, hits);
    }
    for (cr3, hits) in &report.per_process {
        println!("  cr3 {:<18} {}", cr3, hits);
    }
    println!("  rewound:        {}", report.rewound);
}
