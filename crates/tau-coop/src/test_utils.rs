use std::rc::Rc;
use std::sync::Once;

use crate::config::Config;
use crate::reactor::LabReactor;
use crate::runtime::Runtime;

static INIT: Once = Once::new();

/// Route `tracing` output through the test harness so it shows up for
/// failing tests only.
pub(crate) fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .try_init();
    });
}

/// Runtime over a fresh lab reactor.
pub(crate) fn lab_runtime() -> (Runtime, Rc<LabReactor>) {
    init_test_logging();
    let lab = Rc::new(LabReactor::new());
    let rt = Runtime::with_reactor(lab.clone(), Config::default());
    (rt, lab)
}
