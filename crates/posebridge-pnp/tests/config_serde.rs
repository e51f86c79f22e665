#![cfg(feature = "serde")]

use posebridge_pnp::calibration::{GridAxis, GridSearchParams};
use posebridge_pnp::{
    EPnPParams, IterativeParams, LMParams, NumericTol, DEFAULT_MAX_REPROJECTION_ERROR,
};

#[test]
fn iterative_params_fill_missing_fields() -> Result<(), serde_json::Error> {
    let params: IterativeParams =
        serde_json::from_str(r#"{ "lm": { "max_iters": 5 }, "max_reprojection_error": 5.0 }"#)?;

    assert_eq!(params.lm.max_iters, 5);
    assert_eq!(params.lm.lambda_init, LMParams::default().lambda_init);
    assert_eq!(params.max_reprojection_error, Some(5.0));
    assert_eq!(params.tol.degenerate, NumericTol::default().degenerate);

    let params: IterativeParams = serde_json::from_str("{}")?;
    assert_eq!(params.max_reprojection_error, Some(DEFAULT_MAX_REPROJECTION_ERROR));
    Ok(())
}

#[test]
fn epnp_params_round_trip() -> Result<(), serde_json::Error> {
    let params = EPnPParams::default().with_refine_lm(LMParams::default().with_max_iters(7));
    let json = serde_json::to_string(&params)?;
    let back: EPnPParams = serde_json::from_str(&json)?;
    assert_eq!(back.refine_lm.map(|lm| lm.max_iters), Some(7));
    Ok(())
}

#[test]
fn grid_params_from_json() -> Result<(), serde_json::Error> {
    let params: GridSearchParams =
        serde_json::from_str(r#"{ "y": { "min": 10, "max": 20, "step": 5 } }"#)?;
    assert_eq!(params.y, GridAxis::new(10, 20, 5));
    assert_eq!(params.x, GridSearchParams::default().x);
    assert_eq!(params.unit, 0.001);
    Ok(())
}
