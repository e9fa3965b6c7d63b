#![no_main]

use libfuzzer_sys::fuzz_target;
use virtualwatts::formula::{attribute, MatchedPair, Normalizer};
use virtualwatts::report::{Report, ReportKind};

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };

    // Decoding must reject bad input with an error, never a panic
    let power = Report::from_json(ReportKind::Power, input);
    let procfs = Report::from_json(ReportKind::Procfs, input);

    // Anything that decodes must also survive attribution
    if let (Ok(Report::Power(power)), Ok(Report::Procfs(usage))) = (power, procfs) {
        let pair = MatchedPair::new(power, usage);
        let _ = attribute(&pair, Normalizer::GlobalUsage);
        let _ = attribute(&pair, Normalizer::UsageSum);
    }
});
