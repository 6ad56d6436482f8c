// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use slog::{info, o, warn, Drain};

use propolis_passthru::common::RWOp;
use propolis_passthru::ept::MapTable;
use propolis_passthru::hw::pci::{BarN, Bdf, PhysDevice, SoftCfg};
use propolis_passthru::mmio::{MmioTrapHandler, MmioTraps};
use propolis_passthru::vm::EptRoot;
use propolis_passthru::{AddrModel, VirtualDevice, VmCtx};

/// Extent of guest-physical space covered by the fixture tables
const GPA_LIMIT: u64 = 1 << 48;

/// Stand-in for MSI-X table emulation: reads as zero, writes are dropped.
struct TableLogger {
    log: slog::Logger,
}
impl MmioTrapHandler for TableLogger {
    fn trap_rw(&self, owner: Bdf, rwo: RWOp) {
        info!(self.log, "MSI-X table access";
            "bdf" => %owner,
            "offset" => rwo.offset(),
            "len" => rwo.len(),
            "write" => rwo.is_write());
        if let RWOp::Read(ro) = rwo {
            ro.fill(0);
        }
    }
}

fn build_log() -> (slog::Logger, slog_async::AsyncGuard) {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let (drain, guard) = slog_async::Async::new(drain).build_with_guard();
    (slog::Logger::root(drain.fuse(), o!()), guard)
}

fn report(log: &slog::Logger, ept: &MapTable, traps: &MmioTraps) {
    let mappings = ept.mappings();
    info!(log, "second-stage mappings"; "count" => mappings.len());
    for m in mappings {
        info!(log, "mapping";
            "gpa" => format!("{:#x}", m.gpa),
            "hpa" => format!("{:#x}", m.hpa),
            "size" => format!("{:#x}", m.size),
            "flags" => ?m.flags);
    }
    let windows = traps.windows();
    info!(log, "MMIO traps"; "count" => windows.len());
    for (bdf, win) in windows {
        info!(log, "trap"; "bdf" => %bdf, "window" => %win);
    }
}

#[derive(clap::Parser)]
/// Replay guest BAR programming against passthrough devices described by a
/// fixture, and report the resulting mappings and traps.
struct Args {
    /// Fixture configuration file
    #[clap(value_name = "CONFIG", action)]
    config: String,

    /// Detach every device once replay is complete
    #[clap(short, long, action)]
    teardown: bool,
}

fn main() -> anyhow::Result<()> {
    let Args { config, teardown } = Args::parse();

    let (log, _log_async_guard) = build_log();

    let config = passthru_config_toml::parse(&config)
        .with_context(|| format!("Failed to parse {config}"))?;
    let model = config.main.addressing()?;
    let root = EptRoot(config.main.ept_root);

    let ept = Arc::new(MapTable::new(root, GPA_LIMIT));
    let traps = Arc::new(MmioTraps::new(GPA_LIMIT));
    let phys_cfg = Arc::new(SoftCfg::new());
    let relay_offset = config.main.relay_offset;
    let ctx = VmCtx::new(&log, model, root, ept.clone(), traps.clone())
        .with_xlate(Arc::new(move |hpa: u64| {
            hpa.wrapping_add_signed(relay_offset)
        }));
    let hdl: Arc<dyn MmioTrapHandler> =
        Arc::new(TableLogger { log: log.new(o!("component" => "msix")) });

    let mut devices = Vec::with_capacity(config.devices.len());
    for (name, dev) in config.devices.iter() {
        let dlog = log.new(o!("dev" => name.to_string()));
        let bdf = dev.bdf()?;
        let pdev = PhysDevice::new(
            bdf,
            dev.phys_bars(),
            dev.msix_cap()?,
            phys_cfg.clone(),
        )
        .with_context(|| format!("Failed to enumerate {name}"))?;
        let mut vdev = VirtualDevice::init_passthrough(
            &ctx,
            &dlog,
            Arc::new(pdev),
            &dev.pt_config()?,
            hdl.clone(),
        )
        .with_context(|| format!("Failed to attach {name}"))?;

        for w in dev.writes.iter() {
            let handled =
                vdev.write_cfg(&ctx, w.offset, w.width, w.value).is_some();
            if !handled {
                warn!(dlog, "write not handled";
                    "offset" => format!("{:#x}", w.offset),
                    "width" => w.width,
                    "value" => format!("{:#x}", w.value));
            }
        }
        if model == AddrModel::Relayed {
            // mediator has placed the BARs; resolve the table location
            vdev.remap_msix_table_bar(&ctx);
        }

        for n in BarN::iter().take(vdev.nr_bars()) {
            let val = vdev.read_cfg(&ctx, n.cfg_offset(), 4);
            info!(dlog, "BAR register";
                "bar" => ?n,
                "value" => val.map(|v| format!("{v:#010x}")));
        }
        devices.push(vdev);
    }

    report(&log, &ept, &traps);

    if teardown {
        for vdev in devices {
            vdev.teardown(&ctx);
        }
        report(&log, &ept, &traps);
    }

    Ok(())
}
