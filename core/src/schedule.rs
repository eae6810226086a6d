/// Step decay at fixed epoch milestones.
///
/// The learning rate for 0-indexed epoch `e` is `base_lr * gamma^k`, where `k`
/// is the number of milestones `<= e`. Calling [`MultiStepSchedule::step`] once
/// per completed epoch advances the schedule.
#[derive(Clone, Debug, PartialEq)]
pub struct MultiStepSchedule {
    base_lr: f64,
    milestones: Vec<usize>,
    gamma: f64,
    epoch: usize,
}

impl MultiStepSchedule {
    pub fn new(base_lr: f64, milestones: &[usize], gamma: f64) -> Self {
        let mut milestones = milestones.to_vec();
        milestones.sort_unstable();
        milestones.dedup();

        Self {
            base_lr,
            milestones,
            gamma,
            epoch: 0,
        }
    }

    pub fn lr_at(&self, epoch: usize) -> f64 {
        let decays = self.milestones.iter().take_while(|&&m| m <= epoch).count();
        self.base_lr * self.gamma.powi(decays as i32)
    }

    pub fn current(&self) -> f64 {
        self.lr_at(self.epoch)
    }

    /// Advance by one epoch and return the new rate.
    pub fn step(&mut self) -> f64 {
        self.epoch += 1;
        self.current()
    }
}
