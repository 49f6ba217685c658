use adgp::kernels::{Matern52, Scaled};
use adgp::noise_models::UniformNoise;
use adgp::{optimize_params, ElementalModel, GaussianProcess, LbfgsParams, LogScale};
use linfa::ParamGuard;
use ndarray::{arr1, Array1, Array2, Axis};

/// Monthly observations to forecast one step ahead
const SERIES: [f64; 24] = [
    1.12, 1.18, 1.32, 1.29, 1.21, 1.35, 1.48, 1.48, 1.36, 1.19, 1.04, 1.18, 1.15, 1.26, 1.41,
    1.35, 1.25, 1.49, 1.70, 1.70, 1.58, 1.33, 1.14, 1.40,
];

fn main() {
    env_logger::init();

    let mut gp = GaussianProcess::new(
        GaussianProcess::params(Scaled(Matern52), UniformNoise)
            .theta_simil(arr1(&[1.0, 1.0]))
            .theta_noise(arr1(&[0.1]))
            .check()
            .expect("GP params"),
    );

    let mut x = Vec::new();
    let mut y = Vec::new();
    for (t, &v) in SERIES.iter().enumerate() {
        if t >= 3 {
            let xt = Array2::from_shape_vec((x.len(), 1), x.clone()).expect("inputs");
            gp.set_training_data(&xt, &Array1::from(y.clone()))
                .expect("training data");

            let mut model = LogScale::new(&mut gp);
            let init = model.log_theta();
            let lml0 = model.observe(init.as_slice().expect("contiguous")).expect("observe");
            model.drop_gradient();
            let (lml, best) = match optimize_params(&mut model, &init, LbfgsParams::default())
            {
                Ok(res) => res,
                Err(err) => {
                    eprintln!("x={t} optimization failed: {err}");
                    (lml0, init)
                }
            };

            let (mean, std) = gp
                .produce(&arr1(&[t as f64]).insert_axis(Axis(1)))
                .expect("forecast");
            println!(
                "x={t} y={v:.3} mean={:.3} std={:.3} lml0={lml0:.3} lml={lml:.3} theta={}",
                mean[0],
                std[0],
                best.mapv(f64::exp)
            );
        }
        x.push(t as f64);
        y.push(v);
    }
}
