use adgp::kernels::SquaredExponential;
use adgp::noise_models::ConstantNoise;
use adgp::{ElementalModel, GaussianProcess};
use linfa::prelude::*;
use ndarray::{arr1, arr2, Array, Axis};

fn main() {
    env_logger::init();

    let xtrain = arr2(&[[0.0], [1.0], [2.0], [3.0], [4.0]]);
    let ytrain = arr1(&[0.0, 1.0, 1.5, 0.9, 1.0]);

    let mut gp = GaussianProcess::<f64, _, _>::params(SquaredExponential, ConstantNoise(0.01))
        .theta_simil(arr1(&[1.0]))
        .fit(&Dataset::new(xtrain, ytrain))
        .expect("GP fitting");
    println!("{gp}");

    let xtest = Array::linspace(0., 4., 9).insert_axis(Axis(1));
    let (mean, std) = gp.produce(&xtest).expect("GP prediction");
    for ((x, m), s) in xtest.iter().zip(mean.iter()).zip(std.iter()) {
        println!("x={x:.2} mean={m:.4} std={s:.4}");
    }

    // log marginal likelihood and its gradient wrt log(lengthscale)
    let lml = gp.observe(&[0.5f64.ln()]).expect("GP observe");
    let grad = gp.gradient().expect("GP gradient");
    println!("lml={lml:.4} dlml/dlog(l)={:.4}", grad[0]);
}
