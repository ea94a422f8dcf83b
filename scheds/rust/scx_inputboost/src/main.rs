// SPDX-License-Identifier: GPL-2.0
//
// scx_inputboost: Input and display-wake driven CPU frequency floor booster
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use clap::Parser;
use scx_inputboost::run;
use scx_inputboost::Args;

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let llv = match &args.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };

    let mut lcfg = simplelog::ConfigBuilder::new();
    // Falls back to UTC when the local offset cannot be determined.
    let _ = lcfg.set_time_offset_to_local();
    simplelog::TermLogger::init(
        llv,
        lcfg.set_time_level(simplelog::LevelFilter::Error)
            .set_location_level(simplelog::LevelFilter::Off)
            .set_target_level(simplelog::LevelFilter::Off)
            .set_thread_level(simplelog::LevelFilter::Off)
            .build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    run(args)
}
