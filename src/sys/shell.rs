pub(crate) fn activate_high_resolution_timer(_activate: bool) {}
