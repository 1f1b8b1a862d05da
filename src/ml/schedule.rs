//! 早期終了と学習率減衰の判定

/// 検証精度が改善しない状態が続いたら学習を止める
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    best: Option<f64>,
    epochs_without_improvement: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            best: None,
            epochs_without_improvement: 0,
        }
    }

    /// 値を記録し、最良値を更新したらtrueを返す
    pub fn update(&mut self, accuracy: f64) -> bool {
        let improved = self.best.map_or(true, |best| accuracy > best);
        if improved {
            self.best = Some(accuracy);
            self.epochs_without_improvement = 0;
        } else {
            self.epochs_without_improvement += 1;
        }
        improved
    }

    pub fn should_stop(&self) -> bool {
        self.epochs_without_improvement >= self.patience
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }
}

/// 検証損失が停滞したら学習率を下げる
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    factor: f64,
    patience: usize,
    min_lr: f64,
    min_delta: f64,
    best_loss: Option<f64>,
    wait: usize,
    current_lr: f64,
}

impl ReduceLrOnPlateau {
    pub fn new(initial_lr: f64, factor: f64, patience: usize, min_lr: f64, min_delta: f64) -> Self {
        Self {
            factor,
            patience,
            min_lr,
            min_delta,
            best_loss: None,
            wait: 0,
            current_lr: initial_lr,
        }
    }

    /// 検証損失を記録し、現在の学習率を返す
    pub fn step(&mut self, val_loss: f64) -> f64 {
        let improved = self
            .best_loss
            .map_or(true, |best| val_loss < best - self.min_delta);
        if improved {
            self.best_loss = Some(val_loss);
            self.wait = 0;
            return self.current_lr;
        }

        self.wait += 1;
        if self.wait >= self.patience {
            let reduced = (self.current_lr * self.factor).max(self.min_lr);
            if reduced < self.current_lr {
                tracing::info!("Reducing learning rate: {:e} -> {:e}", self.current_lr, reduced);
                self.current_lr = reduced;
            }
            self.wait = 0;
        }
        self.current_lr
    }

    pub fn current_lr(&self) -> f64 {
        self.current_lr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn early_stopping_waits_for_patience() {
        let mut stopper = EarlyStopping::new(2);
        assert!(stopper.update(0.5));
        assert!(!stopper.update(0.5));
        assert!(!stopper.should_stop());
        assert!(!stopper.update(0.4));
        assert!(stopper.should_stop());
        assert_eq!(stopper.best(), Some(0.5));
    }

    #[test]
    fn early_stopping_resets_on_improvement() {
        let mut stopper = EarlyStopping::new(2);
        stopper.update(0.1);
        stopper.update(0.1);
        assert!(stopper.update(0.2));
        assert!(!stopper.should_stop());
    }

    #[test]
    fn plateau_reduces_after_patience_and_respects_floor() {
        let mut sched = ReduceLrOnPlateau::new(1e-3, 0.2, 2, 1e-4, 1e-4);
        assert_eq!(sched.step(1.0), 1e-3);
        assert_eq!(sched.step(1.0), 1e-3);
        let lr = sched.step(1.0);
        assert!((lr - 2e-4).abs() < 1e-12);
        sched.step(1.0);
        let lr = sched.step(1.0);
        assert!((lr - 1e-4).abs() < 1e-12);
    }

    #[test]
    fn plateau_ignores_tiny_improvements() {
        let mut sched = ReduceLrOnPlateau::new(1e-3, 0.5, 1, 1e-7, 1e-2);
        sched.step(1.0);
        let lr = sched.step(0.995);
        assert!((lr - 5e-4).abs() < 1e-12);
    }
}
